//! Listening endpoints.
//!
//! - `handler` - per-connection WebSocket loop feeding the router
//! - `health` - health and metrics routes
//! - `supervisor` - binds every configured endpoint and serves them together

mod handler;
mod health;
pub mod supervisor;


use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

use crate::metrics::ServerMetrics;
use crate::registry::Registry;
use crate::relay::Relay;

pub use supervisor::{Supervisor, bind_all};

/// Shared state for one endpoint's HTTP router.
#[derive(Clone)]
pub(crate) struct EndpointContext {
    pub registry: Registry,
    pub relay: Arc<Relay>,
    pub metrics: Arc<ServerMetrics>,
    pub outbound_queue: usize,
}

/// Span maker that tags each request with the endpoint and a request ID
#[derive(Clone)]
struct RequestIdMakeSpan {
    endpoint: u16,
}

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            endpoint = self.endpoint,
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub(crate) fn app(ctx: EndpointContext) -> Router {
    let endpoint = ctx.registry.endpoint();
    Router::new()
        .route("/", get(handler::websocket_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(health::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan { endpoint }))
        .with_state(ctx)
}
