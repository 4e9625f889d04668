//! Redis pub/sub implementation of the bus.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use super::bus::{Bus, BusError, BusPublisher, BusStream};

pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    /// Accepts any redis URL, e.g. `redis://:password@host:6379/0`.
    pub fn open(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

struct RedisPublisher {
    conn: MultiplexedConnection,
}

#[async_trait]
impl BusPublisher for RedisPublisher {
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BusError> {
        let receivers: i64 = self
            .conn
            .publish(topic, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        debug!(topic, receivers, "published to redis");
        Ok(())
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn connect_publisher(&self) -> Result<Box<dyn BusPublisher>, BusError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Box::new(RedisPublisher { conn }))
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!("Dropping non-text bus payload: {}", e);
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }
}
