//! WebSocket Handler
//!
//! Owns one accepted connection: a writer task drains the handle's outbound
//! queue, and the read loop feeds every text frame to the connection's router.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::StreamExt;
use tracing::{debug, info};

use crate::channel::{ConnectionHandle, drain_outbound};
use crate::router::ConnectionRouter;

use super::EndpointContext;

pub(crate) async fn websocket_handler(
    State(ctx): State<EndpointContext>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

pub(crate) async fn handle_socket(socket: WebSocket, ctx: EndpointContext) {
    let endpoint = ctx.registry.endpoint();
    let (handle, rx) = ConnectionHandle::new(endpoint, ctx.outbound_queue);
    let conn_id = handle.id();
    info!(endpoint, conn_id = %conn_id, "New WebSocket connection");
    ctx.metrics.connection_opened();

    let (ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(drain_outbound(ws_sender, rx, handle.closed_token()));

    let mut router = ConnectionRouter::new(
        handle.clone(),
        ctx.registry.clone(),
        ctx.relay.clone(),
        ctx.metrics.clone(),
    );

    let closed = handle.closed_token();
    loop {
        let frame = tokio::select! {
            // writer gave up on the socket
            _ = closed.cancelled() => break,
            frame = ws_receiver.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => router.handle_frame(text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(endpoint, conn_id = %conn_id, "WebSocket read error: {}", e);
                break;
            }
        }
    }

    router.close().await;
    handle.close();
    let _ = writer.await;
    ctx.metrics.connection_closed();
}
