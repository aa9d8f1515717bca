//! Frame relay between two bus channels

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bus::BusChannel;
use crate::cancel::CancellationFlag;
use crate::frame::BusHandle;
use crate::log::LogSink;

/// Sleep between relay iterations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counters collected by one relay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Non-empty batches received from the source
    pub batches: u64,
    pub frames_forwarded: u64,
    /// Frames lost because the destination rejected their batch
    pub frames_dropped: u64,
    pub receive_errors: u64,
    pub transmit_errors: u64,
}

/// Forwards every frame received on one bus to another, unchanged
///
/// Delivery is at-most-once: a batch the destination rejects is logged and
/// dropped, never retried.
pub struct FrameRelay {
    bus: Arc<dyn BusChannel>,
    sink: Arc<dyn LogSink>,
    poll_interval: Duration,
}

impl FrameRelay {
    pub fn new(bus: Arc<dyn BusChannel>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            bus,
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Relay until `cancel` is set
    pub async fn run(
        &self,
        source: BusHandle,
        destination: BusHandle,
        cancel: &CancellationFlag,
    ) -> RelayStats {
        info!(%source, %destination, interval = ?self.poll_interval, "Frame relay started");
        let mut stats = RelayStats::default();

        while !cancel.is_cancelled() {
            self.relay_once(source, destination, &mut stats).await;
            tokio::time::sleep(self.poll_interval).await;
        }

        info!(
            forwarded = stats.frames_forwarded,
            dropped = stats.frames_dropped,
            "Frame relay stopped"
        );
        stats
    }

    async fn relay_once(&self, source: BusHandle, destination: BusHandle, stats: &mut RelayStats) {
        let frames = match self.bus.receive(source).await {
            Ok(frames) => frames,
            Err(e) => {
                stats.receive_errors += 1;
                self.sink.write_log(&format!("Receive error! {}", e));
                return;
            }
        };
        if frames.is_empty() {
            return;
        }

        let count = frames.len() as u64;
        stats.batches += 1;
        self.sink.write_log(&format!("Received {}", count));
        debug!(%source, %destination, count, "Forwarding frame batch");

        match self.bus.transmit(destination, &frames).await {
            Ok(()) => stats.frames_forwarded += count,
            Err(e) => {
                stats.transmit_errors += 1;
                stats.frames_dropped += count;
                self.sink.write_log(&format!("Transmit error! {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::frame::Frame;
    use crate::log::MemoryLogSink;

    const SRC: BusHandle = BusHandle::new(101);
    const DST: BusHandle = BusHandle::new(102);

    fn relay() -> (Arc<MockBus>, Arc<MemoryLogSink>, FrameRelay) {
        let bus = Arc::new(MockBus::with_bus_ids(&[101, 102]));
        let sink = Arc::new(MemoryLogSink::new());
        let relay = FrameRelay::new(bus.clone(), sink.clone());
        (bus, sink, relay)
    }

    #[tokio::test]
    async fn test_relay_once_forwards_in_order() {
        let (bus, sink, relay) = relay();
        let frames = vec![
            Frame::new(0x100, vec![1]).unwrap(),
            Frame::new_fd(0x200, vec![2; 12], true).unwrap(),
            Frame::new(0x300, vec![3, 3]).unwrap(),
        ];
        bus.inject(SRC, frames.clone());

        let mut stats = RelayStats::default();
        relay.relay_once(SRC, DST, &mut stats).await;

        assert_eq!(bus.transmitted(DST), frames);
        assert_eq!(stats.frames_forwarded, 3);
        assert_eq!(sink.lines(), vec!["Received 3".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_silent() {
        let (bus, sink, relay) = relay();
        let mut stats = RelayStats::default();
        relay.relay_once(SRC, DST, &mut stats).await;

        assert!(bus.transmitted(DST).is_empty());
        assert!(sink.lines().is_empty());
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped() {
        let (bus, sink, relay) = relay();
        bus.fail_next_transmit(1);
        bus.inject(SRC, vec![Frame::new(0x100, vec![1]).unwrap()]);

        let mut stats = RelayStats::default();
        relay.relay_once(SRC, DST, &mut stats).await;
        relay.relay_once(SRC, DST, &mut stats).await;

        assert!(bus.transmitted(DST).is_empty());
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.transmit_errors, 1);
        assert!(sink.contains("Transmit error!"));
    }

    #[tokio::test]
    async fn test_receive_error_is_logged() {
        let (bus, sink, relay) = relay();
        bus.fail_next_receive(1);

        let mut stats = RelayStats::default();
        relay.relay_once(SRC, DST, &mut stats).await;

        assert_eq!(stats.receive_errors, 1);
        assert!(sink.contains("Receive error! Receive failed: injected receive failure"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (bus, _sink, relay) = relay();
        bus.inject(SRC, vec![Frame::new(0x100, vec![1]).unwrap()]);
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let stats = relay.run(SRC, DST, &cancel).await;
        assert_eq!(stats, RelayStats::default());
        assert_eq!(bus.pending(SRC), 1);
    }
}
