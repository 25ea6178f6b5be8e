//! Event log subscription against the in-memory device.

mod common;

use std::time::Duration;

use ads_utilities::{
    index, AdsError, CancellationToken, ChannelSink, ClientConfig, LogEntry, Severity,
};
use common::{client, client_with, wait_for_cleanup, MockDevice, TARGET};
use tokio::sync::mpsc::UnboundedReceiver;

fn address(id: u8) -> Vec<u8> {
    let mut address = vec![0u8; 24];
    address[0] = id;
    address[23] = 0xEE;
    address
}

fn payload(id: u8, level: u8, sender: &str) -> Vec<u8> {
    let mut data = vec![0u8; 12];
    data.extend_from_slice(&address(id));
    data.push(level);
    data.extend_from_slice(&[0, 0, 0]);
    data.extend_from_slice(&[0x20, 0x50, 0x08]);
    data.extend_from_slice(sender.as_bytes());
    data.push(0);
    data
}

async fn next(rx: &mut UnboundedReceiver<LogEntry>) -> LogEntry {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event delivered")
        .expect("sink closed")
}

#[tokio::test]
async fn test_event_delivered_to_sink() {
    let device = MockDevice::new();
    device
        .state()
        .event_messages
        .insert(address(1), "Route added".to_string());
    let client = client(&device);
    let cancel = CancellationToken::new();

    let (sink, mut rx) = ChannelSink::with_channel();
    let mut subscription = client.subscribe_events(sink, &cancel).await.unwrap();
    assert!(subscription.is_active());
    assert_eq!(device.state().active_notifications(), 1);
    assert_eq!(device.state().sessions_open, 2);

    device.emit(index::EVENT_STREAM, &[0u8; 16]);
    device.emit(index::EVENT_STREAM, &payload(1, 7, "TcSysSrv"));

    let entry = next(&mut rx).await;
    assert_eq!(entry.message, "Route added");
    assert_eq!(entry.sender, "TcSysSrv");
    assert_eq!(entry.severity, Severity::Critical);

    subscription.dispose().await;
    assert!(!subscription.is_active());
    assert!(rx.try_recv().is_err());
    let state = device.state();
    assert_eq!(state.active_notifications(), 0);
    assert_eq!(state.sessions_open, 0);
}

#[tokio::test]
async fn test_events_keep_order_and_skip_unresolved() {
    let device = MockDevice::new();
    {
        let mut state = device.state();
        state.event_messages.insert(address(1), "first".to_string());
        state.event_messages.insert(address(3), "third".to_string());
    }
    let client = client(&device);
    let cancel = CancellationToken::new();

    let (sink, mut rx) = ChannelSink::with_channel();
    let mut subscription = client.subscribe_events(sink, &cancel).await.unwrap();

    device.emit(index::EVENT_STREAM, &payload(1, 2, "PLC"));
    device.emit(index::EVENT_STREAM, &payload(2, 2, "PLC"));
    device.emit(index::EVENT_STREAM, &payload(3, 3, "IO"));

    let first = next(&mut rx).await;
    let third = next(&mut rx).await;
    assert_eq!(first.message, "first");
    assert_eq!(first.severity, Severity::Warning);
    assert_eq!(third.message, "third");
    assert_eq!(third.severity, Severity::Error);
    assert_eq!(third.sender, "IO");

    subscription.dispose().await;
}

#[tokio::test]
async fn test_closure_sink() {
    let device = MockDevice::new();
    device
        .state()
        .event_messages
        .insert(address(9), "Config mode".to_string());
    let client = client(&device);
    let cancel = CancellationToken::new();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut subscription = client
        .subscribe_events(
            move |entry: LogEntry| {
                let _ = tx.send(entry.message);
            },
            &cancel,
        )
        .await
        .unwrap();

    device.emit(index::EVENT_STREAM, &payload(9, 0, "System"));
    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, "Config mode");

    subscription.dispose().await;
}

#[tokio::test]
async fn test_dispose_twice_is_noop() {
    let device = MockDevice::new();
    let client = client(&device);
    let cancel = CancellationToken::new();

    let (sink, _rx) = ChannelSink::with_channel();
    let mut subscription = client.subscribe_events(sink, &cancel).await.unwrap();

    subscription.dispose().await;
    subscription.dispose().await;
    assert!(!subscription.is_active());
    let state = device.state();
    assert_eq!(state.active_notifications(), 0);
    assert_eq!(state.sessions_open, 0);
    assert_eq!(state.sessions_opened, 2);
}

#[tokio::test]
async fn test_no_delivery_after_dispose() {
    let device = MockDevice::new();
    device
        .state()
        .event_messages
        .insert(address(1), "late".to_string());
    let client = client(&device);
    let cancel = CancellationToken::new();

    let (sink, mut rx) = ChannelSink::with_channel();
    let mut subscription = client.subscribe_events(sink, &cancel).await.unwrap();
    subscription.dispose().await;

    device.emit(index::EVENT_STREAM, &payload(1, 1, "PLC"));
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribe_unreachable() {
    let device = MockDevice::new();
    device.state().unreachable = true;
    let client = client(&device);
    let cancel = CancellationToken::new();

    let (sink, _rx) = ChannelSink::with_channel();
    let err = client.subscribe_events(sink, &cancel).await.unwrap_err();
    assert!(matches!(err, AdsError::Transport { .. }));
    assert_eq!(device.state().sessions_open, 0);
}

/// Sink that signals when it is entered, then blocks its thread for `busy`.
fn blocking_sink(
    busy: Duration,
) -> (impl FnMut(LogEntry) + Send + 'static, UnboundedReceiver<()>) {
    let (entered, rx) = tokio::sync::mpsc::unbounded_channel();
    let sink = move |_entry: LogEntry| {
        let _ = entered.send(());
        std::thread::sleep(busy);
    };
    (sink, rx)
}

fn slow_device() -> std::sync::Arc<MockDevice> {
    let device = MockDevice::new();
    device
        .state()
        .event_messages
        .insert(address(1), "slow".to_string());
    device
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_timeout_still_closes_detail_session() {
    let device = slow_device();
    let config = ClientConfig::new(TARGET).with_dispose_timeout(Duration::from_millis(250));
    let client = client_with(&device, config);
    let (sink, mut entered) = blocking_sink(Duration::from_millis(400));
    let mut subscription = client
        .subscribe_events(sink, &CancellationToken::new())
        .await
        .unwrap();

    device.emit(index::EVENT_STREAM, &payload(1, 1, "PLC"));
    tokio::time::timeout(Duration::from_secs(5), entered.recv())
        .await
        .unwrap();
    subscription.dispose().await;

    let state = device.state();
    assert_eq!(state.active_notifications(), 0);
    assert_eq!(state.sessions_open, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_stuck_past_dispose_closes_session_when_it_returns() {
    let device = slow_device();
    let config = ClientConfig::new(TARGET).with_dispose_timeout(Duration::from_millis(50));
    let client = client_with(&device, config);
    let (sink, mut entered) = blocking_sink(Duration::from_millis(600));
    let mut subscription = client
        .subscribe_events(sink, &CancellationToken::new())
        .await
        .unwrap();

    device.emit(index::EVENT_STREAM, &payload(1, 1, "PLC"));
    tokio::time::timeout(Duration::from_secs(5), entered.recv())
        .await
        .unwrap();
    let started = std::time::Instant::now();
    subscription.dispose().await;
    assert!(started.elapsed() < Duration::from_millis(600));
    assert_eq!(device.state().active_notifications(), 0);

    wait_for_cleanup(&device).await;
}

#[tokio::test]
async fn test_dropped_subscription_releases_sessions() {
    let device = MockDevice::new();
    let client = client(&device);

    let (sink, _rx) = ChannelSink::with_channel();
    let subscription = client
        .subscribe_events(sink, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(device.state().sessions_open, 2);
    drop(subscription);

    wait_for_cleanup(&device).await;
}
