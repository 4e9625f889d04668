//! Cross-process relay for direct messages.
//!
//! When a direct message's target is not registered on the sender's endpoint,
//! the envelope is published on a shared bus topic. Every process subscribes to
//! that topic and delivers envelopes whose target it holds; the rest discard.
//!
//! - `backoff` - reconnect schedule with attempt and elapsed-time ceilings
//! - `bus` - publish/subscribe seam and the in-process implementation
//! - `redis_bus` - Redis pub/sub implementation

pub mod backoff;
pub mod bus;
pub mod redis_bus;

use futures::StreamExt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelError;
use crate::metrics::ServerMetrics;
use crate::protocol::RelayEnvelope;
use crate::registry::Registries;

use backoff::{Backoff, BackoffPolicy, BackoffStep, GiveUpReason};
use bus::{Bus, BusError, BusPublisher};

/// Topic shared by every process for direct-message hand-off.
pub const DEFAULT_TOPIC: &str = "direct_message_channel";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bus reconnect gave up: {0}")]
    ReconnectExhausted(GiveUpReason),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// State of the subscriber side, which decides whether this process can
/// receive hand-offs at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Starting,
    Subscribed,
    Resubscribing { attempt: u32 },
    /// Reconnect ceiling reached; no further attempts are made.
    Lost,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Subscribed => "subscribed",
            Self::Resubscribing { .. } => "resubscribing",
            Self::Lost => "lost",
        }
    }
}

pub struct Relay {
    bus: Arc<dyn Bus>,
    topic: String,
    policy: BackoffPolicy,
    /// `None` until first connected, and again after a failed publish
    publisher: Mutex<Option<Box<dyn BusPublisher>>>,
    /// Set once publisher reconnects hit the ceiling. Never cleared.
    publisher_lost: OnceLock<GiveUpReason>,
    registries: Registries,
    metrics: Arc<ServerMetrics>,
    status: watch::Sender<RelayStatus>,
}

impl Relay {
    pub fn new(
        bus: Arc<dyn Bus>,
        topic: impl Into<String>,
        policy: BackoffPolicy,
        registries: Registries,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let (status, _) = watch::channel(RelayStatus::Starting);
        Self {
            bus,
            topic: topic.into(),
            policy,
            publisher: Mutex::new(None),
            publisher_lost: OnceLock::new(),
            registries,
            metrics,
            status,
        }
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// True once the publisher gave up reconnecting; every later publish
    /// fails without touching the bus.
    pub fn publisher_lost(&self) -> bool {
        self.publisher_lost.get().is_some()
    }

    #[cfg(test)]
    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Open the publisher eagerly and start the subscriber loop.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        match self.bus.connect_publisher().await {
            Ok(publisher) => {
                *self.publisher.lock().await = Some(publisher);
                info!(topic = %self.topic, "bus publisher connected");
            }
            Err(e) => warn!("bus publisher unavailable at startup, will connect on demand: {}", e),
        }

        let relay = Arc::clone(self);
        tokio::spawn(async move { relay.run_subscriber(cancel).await })
    }

    /// Hand an envelope to the bus. A broken publisher is recreated and the
    /// publish retried once; after that the envelope is dropped. Once the
    /// reconnect ceiling has been reached, publishes fail immediately.
    pub async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        self.check_publisher_lost()?;
        let payload = serde_json::to_string(envelope)?;
        let mut guard = self.publisher.lock().await;
        // the ceiling may have been reached while waiting for the lock
        self.check_publisher_lost()?;

        if let Some(publisher) = guard.as_mut() {
            match publisher.publish(&self.topic, &payload).await {
                Ok(()) => {
                    self.metrics.relay_published();
                    debug!(target_id = %envelope.target_id, "envelope published");
                    return Ok(());
                }
                Err(e) => warn!("bus publisher unavailable, reinitializing: {}", e),
            }
        }
        *guard = None;

        let mut publisher = match self.connect_publisher().await {
            Ok(p) => p,
            Err(e) => {
                self.metrics.relay_publish_failed();
                return Err(e);
            }
        };
        match publisher.publish(&self.topic, &payload).await {
            Ok(()) => {
                *guard = Some(publisher);
                self.metrics.relay_published();
                debug!(target_id = %envelope.target_id, "envelope published after reconnect");
                Ok(())
            }
            Err(e) => {
                self.metrics.relay_publish_failed();
                error!("Failed to publish message to bus: {}", e);
                Err(e.into())
            }
        }
    }

    fn check_publisher_lost(&self) -> Result<(), RelayError> {
        match self.publisher_lost.get() {
            Some(reason) => {
                self.metrics.relay_publish_failed();
                Err(RelayError::ReconnectExhausted(*reason))
            }
            None => Ok(()),
        }
    }

    async fn connect_publisher(&self) -> Result<Box<dyn BusPublisher>, RelayError> {
        let mut backoff = Backoff::new(self.policy, Instant::now());
        loop {
            match self.bus.connect_publisher().await {
                Ok(publisher) => {
                    info!(attempts = backoff.attempt(), "bus publisher connected");
                    return Ok(publisher);
                }
                Err(e) => match backoff.next(Instant::now()) {
                    BackoffStep::Retry { attempt, delay } => {
                        self.metrics.bus_reconnect();
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "bus publisher reconnecting: {}",
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    BackoffStep::GiveUp(reason) => {
                        let _ = self.publisher_lost.set(reason);
                        error!(
                            "bus publisher connection lost permanently, cross-process sends disabled: {}",
                            reason
                        );
                        return Err(RelayError::ReconnectExhausted(reason));
                    }
                },
            }
        }
    }

    async fn run_subscriber(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff: Option<Backoff> = None;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.bus.subscribe(&self.topic) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    backoff = None;
                    self.status.send_replace(RelayStatus::Subscribed);
                    info!(topic = %self.topic, "subscribed to bus");

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = stream.next() => match next {
                                Some(payload) => {
                                    self.deliver(&payload).await;
                                }
                                None => break,
                            },
                        }
                    }
                    warn!(topic = %self.topic, "bus subscription ended");
                }
                Err(e) => warn!("bus subscribe failed: {}", e),
            }

            let backoff = backoff.get_or_insert_with(|| Backoff::new(self.policy, Instant::now()));
            match backoff.next(Instant::now()) {
                BackoffStep::Retry { attempt, delay } => {
                    self.metrics.bus_reconnect();
                    self.status
                        .send_replace(RelayStatus::Resubscribing { attempt });
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                BackoffStep::GiveUp(reason) => {
                    self.status.send_replace(RelayStatus::Lost);
                    error!(
                        "bus subscriber connection lost permanently, cross-process delivery disabled: {}",
                        reason
                    );
                    return;
                }
            }
        }
    }

    /// Deliver one bus payload to every open local connection holding its
    /// target. Returns how many connections received it.
    pub async fn deliver(&self, payload: &str) -> usize {
        let envelope: RelayEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.malformed_frame();
                warn!("Dropping malformed bus envelope: {}", e);
                return 0;
            }
        };

        let targets = self.registries.find_open(&envelope.target_id).await;
        if targets.is_empty() {
            self.metrics.relay_discarded();
            debug!(target_id = %envelope.target_id, "target not held by this process");
            return 0;
        }

        let message = envelope.to_server_message();
        let mut delivered = 0;
        for handle in targets {
            match handle.send(&message) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.relay_delivered();
                }
                Err(ChannelError::Full) => {
                    self.metrics.message_dropped();
                    warn!(
                        endpoint = handle.endpoint(),
                        conn_id = %handle.id(),
                        "outbound queue full, dropping relayed message"
                    );
                }
                Err(ChannelError::Closed) => {}
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use crate::registry::Registry;
    use crate::test_helpers::{fast_policy, open_handle, recv_message, test_relay};
    use bus::MemoryBus;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn envelope(target: &str) -> RelayEnvelope {
        RelayEnvelope {
            target_id: target.into(),
            msg: json!("hi"),
            from_port: 4002,
        }
    }

    #[tokio::test]
    async fn deliver_reaches_registered_target() {
        let registry = Registry::new(4000);
        let (x, mut x_rx) = open_handle(4000);
        registry.put("X".into(), x).await;
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![registry]);

        let payload = serde_json::to_string(&envelope("X")).unwrap();
        assert_eq!(relay.deliver(&payload).await, 1);
        assert_eq!(
            recv_message(&mut x_rx).await,
            ServerMessage::Direct {
                msg: json!("hi"),
                from_port: 4002
            }
        );
    }

    #[tokio::test]
    async fn deliver_discards_unknown_target_without_republishing() {
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![Registry::new(4000)]);

        let payload = serde_json::to_string(&envelope("ghost")).unwrap();
        assert_eq!(relay.deliver(&payload).await, 0);
        assert_eq!(bus.published_count(), 0);
        assert_eq!(relay.metrics.snapshot().relay.discarded, 1);
    }

    #[tokio::test]
    async fn deliver_skips_closed_target() {
        let registry = Registry::new(4000);
        let (x, _x_rx) = open_handle(4000);
        registry.put("X".into(), x.clone()).await;
        x.close();
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![registry]);

        let payload = serde_json::to_string(&envelope("X")).unwrap();
        assert_eq!(relay.deliver(&payload).await, 0);
    }

    #[tokio::test]
    async fn deliver_ignores_malformed_payload() {
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![Registry::new(4000)]);
        assert_eq!(relay.deliver("{not json").await, 0);
        assert_eq!(relay.metrics.snapshot().routing.malformed_frames, 1);
    }

    #[tokio::test]
    async fn publish_emits_envelope_on_topic() {
        let bus = MemoryBus::new();
        let mut tap = bus.subscribe(DEFAULT_TOPIC).await.unwrap();
        let relay = test_relay(&bus, vec![]);

        relay.publish(&envelope("X")).await.unwrap();

        let raw = timeout(Duration::from_secs(1), tap.next())
            .await
            .unwrap()
            .unwrap();
        let seen: RelayEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(seen, envelope("X"));
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn publish_recovers_from_dropped_publisher() {
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![]);
        relay.publish(&envelope("X")).await.unwrap();

        bus.drop_publishers();
        bus.fail_next_connects(2);
        relay.publish(&envelope("Y")).await.unwrap();

        assert_eq!(bus.published_count(), 2);
        let snapshot = relay.metrics.snapshot();
        assert_eq!(snapshot.relay.published, 2);
        assert_eq!(snapshot.relay.reconnects, 2);
    }

    #[tokio::test]
    async fn publish_gives_up_after_reconnect_ceiling() {
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![]);
        bus.fail_next_connects(100);

        let result = relay.publish(&envelope("X")).await;
        assert!(matches!(
            result,
            Err(RelayError::ReconnectExhausted(GiveUpReason::Attempts(_)))
        ));
        assert_eq!(bus.published_count(), 0);
        assert_eq!(relay.metrics.snapshot().relay.publish_failures, 1);
    }

    #[tokio::test]
    async fn publish_fails_fast_once_publisher_lost() {
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![]);
        bus.fail_next_connects(1000);

        assert!(relay.publish(&envelope("X")).await.is_err());
        assert!(relay.publisher_lost());
        let reconnects = relay.metrics.snapshot().relay.reconnects;
        assert_eq!(reconnects, u64::from(fast_policy().max_attempts));

        // The ceiling is permanent, even once the broker would accept again.
        bus.fail_next_connects(0);
        for _ in 0..3 {
            let result = timeout(Duration::from_millis(100), relay.publish(&envelope("X")))
                .await
                .unwrap();
            assert!(matches!(
                result,
                Err(RelayError::ReconnectExhausted(GiveUpReason::Attempts(_)))
            ));
        }

        let snapshot = relay.metrics.snapshot();
        assert_eq!(snapshot.relay.reconnects, reconnects);
        assert_eq!(snapshot.relay.publish_failures, 4);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn subscriber_delivers_published_envelopes() {
        let registry = Registry::new(4000);
        let (x, mut x_rx) = open_handle(4000);
        registry.put("X".into(), x).await;
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![registry]);

        let cancel = CancellationToken::new();
        let task = relay.start(cancel.clone()).await;
        let mut status = relay.watch_status();
        timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == RelayStatus::Subscribed),
        )
        .await
        .unwrap()
        .unwrap();

        relay.publish(&envelope("X")).await.unwrap();
        assert!(matches!(
            recv_message(&mut x_rx).await,
            ServerMessage::Direct { from_port: 4002, .. }
        ));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_resubscribes_after_subscription_loss() {
        let registry = Registry::new(4000);
        let (x, mut x_rx) = open_handle(4000);
        registry.put("X".into(), x).await;
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![registry]);

        let cancel = CancellationToken::new();
        let task = relay.start(cancel.clone()).await;
        let mut status = relay.watch_status();
        timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == RelayStatus::Subscribed),
        )
        .await
        .unwrap()
        .unwrap();

        bus.drop_subscribers(DEFAULT_TOPIC);
        // Resubscribing may already be overwritten; any change means the loss was seen.
        timeout(Duration::from_secs(1), status.changed())
            .await
            .unwrap()
            .unwrap();
        timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == RelayStatus::Subscribed),
        )
        .await
        .unwrap()
        .unwrap();

        relay.publish(&envelope("X")).await.unwrap();
        assert!(matches!(
            recv_message(&mut x_rx).await,
            ServerMessage::Direct { .. }
        ));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_marks_relay_lost_when_ceiling_reached() {
        let bus = MemoryBus::new();
        let relay = test_relay(&bus, vec![]);
        // one for the eager publisher, the rest for subscribe attempts
        bus.fail_next_connects(1 + fast_policy().max_attempts + 1);

        let task = relay.start(CancellationToken::new()).await;
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(relay.status(), RelayStatus::Lost);
    }
}
