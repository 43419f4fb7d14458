use std::time::Duration;

use cdc_listener::{ChangeEvent, HandlerSet, ListenerConfig};
use mock_crm::{MockCrm, MockCrmHandle};
use once_cell::sync::Lazy;
use tokio::sync::mpsc;

pub const CHANNEL: &str = "/data/ChangeEvents";

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
});

/// Mock server with a short keep-alive so polls cycle quickly under test.
pub async fn spawn_mock() -> MockCrmHandle {
    Lazy::force(&TRACING);
    MockCrm::new()
        .with_keep_alive(Duration::from_millis(150))
        .spawn()
        .await
        .expect("mock server failed to start")
}

/// Password configuration pointed at the mock, with bounds tightened for
/// tests. The read timeout must stay above the mock's keep-alive.
pub fn listener_config(mock: &MockCrmHandle) -> ListenerConfig {
    ListenerConfig::password("user@example.com", "hunter2")
        .with_login_url(mock.base_url().clone())
        .with_connection_timeout(Duration::from_secs(2))
        .with_read_timeout(Duration::from_secs(3))
        .with_keep_alive_interval(Duration::from_millis(150))
}

/// Handler set forwarding every delivered event into one channel.
pub fn recording_handlers() -> (HandlerSet, mpsc::UnboundedReceiver<ChangeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let forward = |tx: mpsc::UnboundedSender<ChangeEvent>| {
        move |event: ChangeEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        }
    };
    let handlers = HandlerSet::new()
        .on_create(forward(tx.clone()))
        .on_update(forward(tx.clone()))
        .on_delete(forward(tx.clone()))
        .on_undelete(forward(tx));
    (handlers, rx)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Asserts quiet for a settle window; at-most-once checks rely on this. A
/// closed channel (registration already detached) counts as quiet.
pub async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) {
    match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(event)) => panic!("unexpected event: {event:?}"),
    }
}

pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {description}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
