//! Relay metrics for observability
//!
//! Provides runtime counters for monitoring routing and bus health.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide metrics, shared by every endpoint and the relay
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Routing metrics
    /// Frames received from clients
    pub frames_received: AtomicU64,
    /// Frames that failed to decode
    pub malformed_frames: AtomicU64,
    /// Successful `setid` registrations
    pub registrations: AtomicU64,
    /// Broadcast messages fanned out (counted once per sender message)
    pub broadcasts: AtomicU64,
    /// Direct messages delivered without touching the bus
    pub direct_local: AtomicU64,
    /// Messages dropped because a client's outbound queue was full
    pub messages_dropped: AtomicU64,
    /// Closed connections evicted from a registry during routing
    pub stale_evictions: AtomicU64,

    // Bus metrics
    /// Envelopes published to the bus
    pub relay_published: AtomicU64,
    /// Envelopes dropped after the retried publish failed
    pub relay_publish_failures: AtomicU64,
    /// Envelopes from the bus delivered to a local connection
    pub relay_delivered: AtomicU64,
    /// Envelopes from the bus with no local target
    pub relay_discarded: AtomicU64,
    /// Reconnect attempts for either bus connection
    pub bus_reconnects: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Routing
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registered(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn direct_local(&self) {
        self.direct_local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_evicted(&self, count: u64) {
        self.stale_evictions.fetch_add(count, Ordering::Relaxed);
    }

    // Bus
    pub fn relay_published(&self) {
        self.relay_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_publish_failed(&self) {
        self.relay_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_delivered(&self) {
        self.relay_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_discarded(&self) {
        self.relay_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_reconnect(&self) {
        self.bus_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            routing: RoutingMetrics {
                frames_received: self.frames_received.load(Ordering::Relaxed),
                malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
                registrations: self.registrations.load(Ordering::Relaxed),
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
                direct_local: self.direct_local.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            },
            relay: RelayMetrics {
                published: self.relay_published.load(Ordering::Relaxed),
                publish_failures: self.relay_publish_failures.load(Ordering::Relaxed),
                delivered: self.relay_delivered.load(Ordering::Relaxed),
                discarded: self.relay_discarded.load(Ordering::Relaxed),
                reconnects: self.bus_reconnects.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub routing: RoutingMetrics,
    pub relay: RelayMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetrics {
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub registrations: u64,
    pub broadcasts: u64,
    pub direct_local: u64,
    pub dropped: u64,
    pub stale_evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub published: u64,
    pub publish_failures: u64,
    pub delivered: u64,
    pub discarded: u64,
    pub reconnects: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub endpoint: u16,
    pub registered_clients: u64,
    pub relay: String,
    /// Set while the subscriber is waiting to resubscribe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resubscribe_attempt: Option<u32>,
    /// False once the publisher gave up reconnecting
    pub publisher_available: bool,
    pub connections: u64,
    pub uptime_secs: u64,
}
