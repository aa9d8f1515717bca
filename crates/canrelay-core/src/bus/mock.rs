//! In-memory bus for testing and development

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{BusChannel, BusError};
use crate::config::{BusConfig, MockConfig};
use crate::frame::{BusHandle, BusInfo, Frame};

/// Reacts to frames transmitted on a [`MockBus`] channel
///
/// Frames returned by the responder are queued for `receive` on the same
/// channel, which is how a simulated ECU answers a tester.
pub trait FrameResponder: Send + Sync {
    fn on_frame(&self, frame: &Frame) -> Vec<Frame>;
}

#[derive(Default)]
struct ChannelQueues {
    rx: VecDeque<Frame>,
    transmitted: Vec<Frame>,
}

/// Mock bus host for testing
pub struct MockBus {
    config: MockConfig,
    buses: Vec<BusInfo>,
    channels: Mutex<HashMap<u32, ChannelQueues>>,
    responders: RwLock<HashMap<u32, Vec<Arc<dyn FrameResponder>>>>,
    receive_failures: AtomicUsize,
    transmit_failures: AtomicUsize,
    connected: AtomicBool,
    clock: Instant,
}

impl MockBus {
    pub fn new(config: &MockConfig, buses: Vec<BusInfo>) -> Self {
        let channels = buses
            .iter()
            .map(|bus| (bus.bus_id, ChannelQueues::default()))
            .collect();
        Self {
            config: config.clone(),
            buses,
            channels: Mutex::new(channels),
            responders: RwLock::new(HashMap::new()),
            receive_failures: AtomicUsize::new(0),
            transmit_failures: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            clock: Instant::now(),
        }
    }

    /// Mock bus with plain channels and no latency
    pub fn with_bus_ids(bus_ids: &[u32]) -> Self {
        let buses = bus_ids.iter().copied().map(BusInfo::new).collect();
        Self::new(&MockConfig::default(), buses)
    }

    pub fn from_config(config: &MockConfig, buses: &[BusConfig]) -> Self {
        Self::new(config, buses.iter().map(BusConfig::info).collect())
    }

    /// Queue frames as if they had been received on `bus`
    pub fn inject(&self, bus: BusHandle, frames: impl IntoIterator<Item = Frame>) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(&bus.bus_id()) {
            channel.rx.extend(frames);
        } else {
            tracing::warn!(%bus, "Mock bus: inject on unknown bus ignored");
        }
    }

    /// Everything successfully transmitted on `bus` so far
    pub fn transmitted(&self, bus: BusHandle) -> Vec<Frame> {
        self.channels
            .lock()
            .get(&bus.bus_id())
            .map(|channel| channel.transmitted.clone())
            .unwrap_or_default()
    }

    /// Frames queued for receive and not yet polled
    pub fn pending(&self, bus: BusHandle) -> usize {
        self.channels
            .lock()
            .get(&bus.bus_id())
            .map(|channel| channel.rx.len())
            .unwrap_or(0)
    }

    /// Attach a responder to every frame transmitted on `bus`
    pub fn attach(&self, bus: BusHandle, responder: Arc<dyn FrameResponder>) {
        self.responders
            .write()
            .entry(bus.bus_id())
            .or_default()
            .push(responder);
    }

    /// Make the next `count` receive calls fail
    pub fn fail_next_receive(&self, count: usize) {
        self.receive_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` transmit calls fail (their frames are dropped)
    pub fn fail_next_transmit(&self, count: usize) {
        self.transmit_failures.store(count, Ordering::SeqCst);
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn now_micros(&self) -> u64 {
        self.clock.elapsed().as_micros() as u64
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    fn check_connected(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Disconnected)
        }
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BusChannel for MockBus {
    fn list_buses(&self) -> Result<Vec<BusInfo>, BusError> {
        self.check_connected()?;
        Ok(self.buses.clone())
    }

    async fn receive(&self, bus: BusHandle) -> Result<Vec<Frame>, BusError> {
        self.simulate_latency().await;
        self.check_connected()?;

        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(&bus.bus_id())
            .ok_or(BusError::UnknownBus(bus.bus_id()))?;

        if take_failure(&self.receive_failures) {
            return Err(BusError::ReceiveFailed("injected receive failure".to_string()));
        }

        Ok(channel.rx.drain(..).collect())
    }

    async fn transmit(&self, bus: BusHandle, frames: &[Frame]) -> Result<(), BusError> {
        self.simulate_latency().await;
        self.check_connected()?;

        {
            let mut channels = self.channels.lock();
            let channel = channels
                .get_mut(&bus.bus_id())
                .ok_or(BusError::UnknownBus(bus.bus_id()))?;

            if take_failure(&self.transmit_failures) {
                return Err(BusError::TransmitFailed(
                    "injected transmit failure".to_string(),
                ));
            }
            channel.transmitted.extend_from_slice(frames);
        }

        tracing::debug!(%bus, count = frames.len(), "Mock bus: frames transmitted");

        let responders = self
            .responders
            .read()
            .get(&bus.bus_id())
            .cloned()
            .unwrap_or_default();
        if responders.is_empty() {
            return Ok(());
        }

        let mut replies = Vec::new();
        for frame in frames {
            for responder in &responders {
                replies.extend(responder.on_frame(frame));
            }
        }
        if !replies.is_empty() {
            let now = self.now_micros();
            let mut channels = self.channels.lock();
            if let Some(channel) = channels.get_mut(&bus.bus_id()) {
                channel
                    .rx
                    .extend(replies.into_iter().map(|frame| frame.with_timestamp(now)));
            }
        }

        Ok(())
    }
}
