use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::channel::ConnectionHandle;
use crate::metrics::ServerMetrics;
use crate::protocol::{EndpointId, ServerMessage};
use crate::registry::{Registries, Registry};
use crate::relay::backoff::BackoffPolicy;
use crate::relay::bus::MemoryBus;
use crate::relay::{DEFAULT_TOPIC, Relay};

/// Timeout for each awaited receive in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Backoff short enough that exhausting it takes milliseconds.
pub fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        step: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts: 3,
        max_elapsed: Duration::from_secs(5),
    }
}

/// An open handle plus its outbound queue. Hold the receiver for as long as
/// the handle should read as open.
pub fn open_handle(endpoint: EndpointId) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
    ConnectionHandle::new(endpoint, 16)
}

/// A relay on `bus` with fresh metrics, covering `registries`.
pub fn test_relay(bus: &MemoryBus, registries: Vec<Registry>) -> Arc<Relay> {
    Arc::new(Relay::new(
        Arc::new(bus.clone()),
        DEFAULT_TOPIC,
        fast_policy(),
        Registries::new(registries),
        Arc::new(ServerMetrics::new()),
    ))
}

pub async fn recv_message(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("outbound queue closed")
}

/// Assert nothing is queued right now.
pub fn assert_silent(rx: &mut mpsc::Receiver<ServerMessage>) {
    if let Ok(msg) = rx.try_recv() {
        panic!("unexpected message: {msg:?}");
    }
}
