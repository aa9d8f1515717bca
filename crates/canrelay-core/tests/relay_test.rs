//! Frame relay integration tests
//!
//! Run with: cargo test -p canrelay-core --test relay_test

use std::sync::Arc;
use std::time::Duration;

use canrelay_core::config::BusConfig;
use canrelay_core::{
    BusHandle, CancellationFlag, Frame, FrameRelay, MemoryLogSink, MockBus, RunOutcome,
    RunnerConfig, ScriptRunner,
};
use pretty_assertions::assert_eq;
use serde_json::Value;

const SOURCE: BusHandle = BusHandle::new(101);
const DESTINATION: BusHandle = BusHandle::new(102);

fn mock_bus() -> Arc<MockBus> {
    Arc::new(MockBus::with_bus_ids(&[101, 102]))
}

// =============================================================================
// Runner Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_relay_scenario_forwards_single_frame() {
    let bus = mock_bus();
    let sink = Arc::new(MemoryLogSink::new());
    let runner = ScriptRunner::new(bus.clone(), sink.clone(), RunnerConfig::default());

    let frame = Frame::new(0x123, vec![1, 2, 3]).unwrap().with_timestamp(1000);
    bus.inject(SOURCE, vec![frame.clone()]);

    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.on_notify("stop", &Value::Null);
    };
    let (outcome, ()) = tokio::join!(runner.on_main(), stop);

    assert_eq!(outcome, RunOutcome::Stopped);
    let forwarded = bus.transmitted(DESTINATION);
    assert_eq!(forwarded, vec![frame]);
    assert_eq!(forwarded[0].timestamp_micros(), 1000);
    assert!(!forwarded[0].is_fd());
    assert!(!forwarded[0].brs());

    let lines = sink.lines();
    assert_eq!(lines.iter().filter(|l| l.starts_with("Received")).count(), 1);
    assert!(sink.contains("Received 1"));
    assert!(sink.contains("Stop..."));
}

#[tokio::test]
async fn test_relay_scenario_single_bus() {
    let bus = Arc::new(MockBus::with_bus_ids(&[101]));
    let sink = Arc::new(MemoryLogSink::new());
    let config = RunnerConfig {
        buses: vec![BusConfig::new(101)],
        ..Default::default()
    };
    let runner = ScriptRunner::new(bus.clone(), sink, config);

    assert_eq!(
        runner.on_main().await,
        RunOutcome::InsufficientBuses {
            required: 2,
            found: 1
        }
    );
    assert!(bus.transmitted(SOURCE).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_relay_uses_configured_direction() {
    let bus = mock_bus();
    let sink = Arc::new(MemoryLogSink::new());
    let mut config = RunnerConfig::default();
    config.relay.source_bus = Some(102);
    config.relay.destination_bus = Some(101);
    let runner = ScriptRunner::new(bus.clone(), sink, config);

    bus.inject(DESTINATION, vec![Frame::new(0x7DF, vec![0x02, 0x01, 0x0C]).unwrap()]);

    let cancel = runner.cancellation();
    let stop = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    };
    tokio::join!(runner.on_main(), stop);

    assert_eq!(bus.transmitted(SOURCE).len(), 1);
    assert!(bus.transmitted(DESTINATION).is_empty());
}

// =============================================================================
// Relay Loop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_relay_preserves_batches_and_order() {
    let bus = mock_bus();
    let relay = FrameRelay::new(bus.clone(), Arc::new(MemoryLogSink::new()));
    let cancel = CancellationFlag::new();

    let first: Vec<Frame> = (0..4)
        .map(|i| Frame::new(0x100 + i, vec![i as u8; 8]).unwrap())
        .collect();
    let second = vec![
        Frame::new_fd(0x200, vec![0xAA; 64], true).unwrap(),
        Frame::new_fd(0x201, vec![0xBB; 12], false).unwrap(),
    ];

    let traffic = async {
        bus.inject(SOURCE, first.clone());
        tokio::time::sleep(Duration::from_millis(25)).await;
        bus.inject(SOURCE, second.clone());
        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
    };
    let (stats, ()) = tokio::join!(relay.run(SOURCE, DESTINATION, &cancel), traffic);

    let mut expected = first.clone();
    expected.extend(second.clone());
    assert_eq!(bus.transmitted(DESTINATION), expected);
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.frames_forwarded, 6);
    assert!(bus.transmitted(DESTINATION)[4].brs());
}

#[tokio::test(start_paused = true)]
async fn test_relay_drops_failed_batch_without_retry() {
    let bus = mock_bus();
    let sink = Arc::new(MemoryLogSink::new());
    let relay = FrameRelay::new(bus.clone(), sink.clone());
    let cancel = CancellationFlag::new();

    bus.fail_next_transmit(1);
    bus.inject(SOURCE, vec![Frame::new(0x123, vec![1]).unwrap()]);

    let traffic = async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        bus.inject(SOURCE, vec![Frame::new(0x124, vec![2]).unwrap()]);
        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
    };
    let (stats, ()) = tokio::join!(relay.run(SOURCE, DESTINATION, &cancel), traffic);

    let forwarded = bus.transmitted(DESTINATION);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].id(), 0x124);
    assert_eq!(stats.frames_dropped, 1);
    assert!(sink.contains("Transmit error! Transmit failed: injected transmit failure"));
}

#[tokio::test(start_paused = true)]
async fn test_relay_survives_receive_errors() {
    let bus = mock_bus();
    let sink = Arc::new(MemoryLogSink::new());
    let relay = FrameRelay::new(bus.clone(), sink.clone());
    let cancel = CancellationFlag::new();

    bus.fail_next_receive(3);
    bus.inject(SOURCE, vec![Frame::new(0x321, vec![9, 9]).unwrap()]);

    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };
    let (stats, ()) = tokio::join!(relay.run(SOURCE, DESTINATION, &cancel), stop);

    assert_eq!(stats.receive_errors, 3);
    assert_eq!(bus.transmitted(DESTINATION).len(), 1);
    assert!(sink.contains("Receive error!"));
}

#[tokio::test(start_paused = true)]
async fn test_relay_stops_within_one_poll_interval() {
    let bus = mock_bus();
    let relay = FrameRelay::new(bus, Arc::new(MemoryLogSink::new()))
        .with_poll_interval(Duration::from_millis(10));
    let cancel = CancellationFlag::new();

    let stopped_at = async {
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        tokio::time::Instant::now()
    };
    let ((_, finished_at), requested_at) = tokio::join!(
        async {
            let stats = relay.run(SOURCE, DESTINATION, &cancel).await;
            (stats, tokio::time::Instant::now())
        },
        stopped_at
    );

    assert!(finished_at >= requested_at);
    assert!(finished_at - requested_at <= Duration::from_millis(10));
}
