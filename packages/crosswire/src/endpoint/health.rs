use axum::{Json, extract::State, response::IntoResponse};

use crate::metrics::HealthStatus;
use crate::relay::RelayStatus;

use super::EndpointContext;

/// Health check endpoint - degraded while either side of the bus is down
pub(crate) async fn health_handler(State(ctx): State<EndpointContext>) -> impl IntoResponse {
    Json(health_status(&ctx).await)
}

/// Metrics endpoint - process-wide counters
pub(crate) async fn metrics_handler(State(ctx): State<EndpointContext>) -> impl IntoResponse {
    Json(ctx.metrics.snapshot())
}

async fn health_status(ctx: &EndpointContext) -> HealthStatus {
    let relay_status = ctx.relay.status();
    let publisher_available = !ctx.relay.publisher_lost();
    let metrics = ctx.metrics.snapshot();

    let (status, resubscribe_attempt) = relay_health(relay_status, publisher_available);

    HealthStatus {
        status: status.to_string(),
        endpoint: ctx.registry.endpoint(),
        registered_clients: ctx.registry.len().await as u64,
        relay: relay_status.as_str().to_string(),
        resubscribe_attempt,
        publisher_available,
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    }
}

/// Overall status plus the pending resubscribe attempt, if any.
fn relay_health(status: RelayStatus, publisher_available: bool) -> (&'static str, Option<u32>) {
    match status {
        RelayStatus::Subscribed if publisher_available => ("healthy", None),
        RelayStatus::Resubscribing { attempt } => ("degraded", Some(attempt)),
        _ => ("degraded", None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServerMetrics;
    use crate::registry::Registry;
    use crate::relay::bus::MemoryBus;
    use crate::test_helpers::{TEST_TIMEOUT, open_handle, test_relay};
    use std::sync::Arc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn context(bus: &MemoryBus, registry: Registry) -> EndpointContext {
        let relay = test_relay(bus, vec![registry.clone()]);
        EndpointContext {
            registry,
            relay,
            metrics: Arc::new(ServerMetrics::new()),
            outbound_queue: 16,
        }
    }

    #[test]
    fn relay_health_by_status() {
        assert_eq!(relay_health(RelayStatus::Subscribed, true), ("healthy", None));
        assert_eq!(relay_health(RelayStatus::Subscribed, false), ("degraded", None));
        assert_eq!(
            relay_health(RelayStatus::Resubscribing { attempt: 3 }, true),
            ("degraded", Some(3))
        );
        assert_eq!(relay_health(RelayStatus::Lost, true), ("degraded", None));
    }

    #[tokio::test]
    async fn starting_relay_reports_degraded() {
        let bus = MemoryBus::new();
        let registry = Registry::new(4002);
        let (x, _x_rx) = open_handle(4002);
        registry.put("x".into(), x).await;
        let ctx = context(&bus, registry);

        let health = health_status(&ctx).await;
        assert_eq!(health.status, "degraded");
        assert_eq!(health.relay, "starting");
        assert_eq!(health.registered_clients, 1);
        assert_eq!(health.endpoint, 4002);
        assert!(health.publisher_available);
        assert_eq!(health.resubscribe_attempt, None);
    }

    #[tokio::test]
    async fn lost_publisher_reports_degraded_while_subscribed() {
        let bus = MemoryBus::new();
        let ctx = context(&bus, Registry::new(4002));
        let cancel = CancellationToken::new();
        ctx.relay.start(cancel.clone()).await;
        let mut status = ctx.relay.watch_status();
        timeout(TEST_TIMEOUT, status.wait_for(|s| *s == RelayStatus::Subscribed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health_status(&ctx).await.status, "healthy");

        bus.drop_publishers();
        bus.fail_next_connects(1000);
        let envelope = crate::protocol::RelayEnvelope {
            target_id: "ghost".into(),
            msg: serde_json::Value::Null,
            from_port: 4002,
        };
        assert!(ctx.relay.publish(&envelope).await.is_err());

        let health = health_status(&ctx).await;
        assert_eq!(health.relay, "subscribed");
        assert!(!health.publisher_available);
        assert_eq!(health.status, "degraded");
        cancel.cancel();
    }
}
