//! Publish/subscribe bus seam.
//!
//! The relay only needs two things from a broker: a publisher it can recreate
//! when the connection drops, and a stream of payloads for one topic. Redis
//! provides these in production; [`MemoryBus`] provides them inside a single
//! process.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

/// Payloads received on a subscribed topic. The stream ends when the
/// subscription is lost.
pub type BusStream = BoxStream<'static, String>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("bus connection closed")]
    Closed,
}

#[async_trait]
pub trait BusPublisher: Send {
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BusError>;
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Open a fresh publisher connection.
    async fn connect_publisher(&self) -> Result<Box<dyn BusPublisher>, BusError>;

    /// Open a fresh subscriber connection and subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<BusStream, BusError>;
}

const MEMORY_TOPIC_CAPACITY: usize = 1024;

/// In-process bus. Every clone shares the same topics, so two relays built on
/// clones of one `MemoryBus` behave like two processes on one broker.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

#[derive(Default)]
struct MemoryBusInner {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    /// Bumped to invalidate every publisher handed out so far
    generation: AtomicU64,
    failing_connects: AtomicU32,
    published: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payloads accepted across all publishers.
    #[cfg(test)]
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Break every existing publisher connection, as if the broker dropped them.
    #[cfg(test)]
    pub fn drop_publishers(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Refuse the next `count` connection attempts (publisher or subscriber).
    #[cfg(test)]
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// End every live subscription on `topic`.
    #[cfg(test)]
    pub fn drop_subscribers(&self, topic: &str) {
        if let Ok(mut topics) = self.inner.topics.lock() {
            topics.remove(topic);
        }
    }

    fn check_connect(&self) -> Result<(), BusError> {
        let refused = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            Err(BusError::Connect("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<String>, BusError> {
        let mut topics = self.inner.topics.lock().map_err(|_| BusError::Closed)?;
        Ok(topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_TOPIC_CAPACITY).0)
            .clone())
    }
}

struct MemoryPublisher {
    bus: MemoryBus,
    generation: u64,
}

#[async_trait]
impl BusPublisher for MemoryPublisher {
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BusError> {
        if self.bus.inner.generation.load(Ordering::SeqCst) != self.generation {
            return Err(BusError::Closed);
        }
        // No subscribers is not an error, matching broker semantics.
        let _ = self.bus.sender(topic)?.send(payload.to_string());
        self.bus.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn connect_publisher(&self) -> Result<Box<dyn BusPublisher>, BusError> {
        self.check_connect()?;
        Ok(Box::new(MemoryPublisher {
            bus: self.clone(),
            generation: self.inner.generation.load(Ordering::SeqCst),
        }))
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, BusError> {
        self.check_connect()?;
        let rx = self.sender(topic)?.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("bus subscriber lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TOPIC: &str = "direct_message_channel";

    #[tokio::test]
    async fn published_payloads_reach_every_subscriber() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe(TOPIC).await.unwrap();
        let mut second = bus.clone().subscribe(TOPIC).await.unwrap();

        let mut publisher = bus.connect_publisher().await.unwrap();
        publisher.publish(TOPIC, "hello").await.unwrap();

        let wait = Duration::from_secs(1);
        assert_eq!(timeout(wait, first.next()).await.unwrap().unwrap(), "hello");
        assert_eq!(timeout(wait, second.next()).await.unwrap().unwrap(), "hello");
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = MemoryBus::new();
        let mut other = bus.subscribe("other").await.unwrap();
        let mut publisher = bus.connect_publisher().await.unwrap();
        publisher.publish(TOPIC, "hello").await.unwrap();

        assert!(
            timeout(Duration::from_millis(50), other.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn dropped_publishers_fail_until_reconnected() {
        let bus = MemoryBus::new();
        let mut publisher = bus.connect_publisher().await.unwrap();
        bus.drop_publishers();

        assert!(matches!(
            publisher.publish(TOPIC, "x").await,
            Err(BusError::Closed)
        ));
        let mut fresh = bus.connect_publisher().await.unwrap();
        fresh.publish(TOPIC, "x").await.unwrap();
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn refused_connects_are_counted_down() {
        let bus = MemoryBus::new();
        bus.fail_next_connects(2);
        assert!(bus.connect_publisher().await.is_err());
        assert!(bus.subscribe(TOPIC).await.is_err());
        assert!(bus.connect_publisher().await.is_ok());
    }

    #[tokio::test]
    async fn dropping_subscribers_ends_streams() {
        let bus = MemoryBus::new();
        let mut stream = bus.subscribe(TOPIC).await.unwrap();
        bus.drop_subscribers(TOPIC);
        let next = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(next.is_none());
    }
}
