//! Connection Router
//!
//! Per-connection state machine that turns decoded client messages into
//! registry updates, local sends and relay hand-offs.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ConnectionHandle};
use crate::metrics::ServerMetrics;
use crate::protocol::{ClientId, ClientMessage, RelayEnvelope, ServerMessage, decode_client_message};
use crate::registry::Registry;
use crate::relay::Relay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterState {
    Unregistered,
    Registered(ClientId),
    Closed,
}

/// Where a direct message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectOutcome {
    Local,
    Relayed,
    Dropped,
}

pub struct ConnectionRouter {
    handle: ConnectionHandle,
    registry: Registry,
    relay: Arc<Relay>,
    metrics: Arc<ServerMetrics>,
    state: RouterState,
}

impl ConnectionRouter {
    pub fn new(
        handle: ConnectionHandle,
        registry: Registry,
        relay: Arc<Relay>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            handle,
            registry,
            relay,
            metrics,
            state: RouterState::Unregistered,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &RouterState {
        &self.state
    }

    fn client_id(&self) -> Option<&ClientId> {
        match &self.state {
            RouterState::Registered(id) => Some(id),
            _ => None,
        }
    }

    /// Handle one inbound text frame. Undecodable frames are logged and
    /// otherwise ignored; the connection stays open.
    pub async fn handle_frame(&mut self, text: &str) {
        if self.state == RouterState::Closed {
            return;
        }
        self.metrics.frame_received();

        match decode_client_message(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                self.metrics.malformed_frame();
                warn!(
                    endpoint = self.registry.endpoint(),
                    conn_id = %self.handle.id(),
                    "Ignoring frame: {}",
                    e
                );
            }
        }
    }

    pub async fn handle_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Register { client_id } => self.register(client_id).await,
            ClientMessage::Broadcast { msg } => {
                self.broadcast(msg).await;
            }
            ClientMessage::Direct { msg, target_id } => {
                self.direct(msg, target_id).await;
            }
        }
    }

    pub async fn register(&mut self, client_id: ClientId) {
        if let RouterState::Registered(previous) = &self.state {
            if *previous != client_id {
                self.registry
                    .remove_if_owned(previous, self.handle.id())
                    .await;
            }
        }

        self.registry
            .put(client_id.clone(), self.handle.clone())
            .await;
        self.metrics.registered();
        info!(
            endpoint = self.registry.endpoint(),
            client_id = %client_id,
            "Client registered"
        );

        self.send_own(&ServerMessage::confirmation(&client_id));
        self.state = RouterState::Registered(client_id);
    }

    /// Fan out to every other open connection on this endpoint. Returns the
    /// number of connections reached.
    pub async fn broadcast(&mut self, msg: serde_json::Value) -> usize {
        let sender = self.client_id().cloned();
        let out = ServerMessage::Broadcast {
            msg,
            from: sender.clone(),
        };
        self.metrics.broadcast();

        let mut reached = 0;
        let mut stale = Vec::new();
        for (id, handle) in self.registry.snapshot().await {
            if handle.id() == self.handle.id() || sender.as_ref() == Some(&id) {
                continue;
            }
            if !handle.is_open() {
                stale.push((id, handle));
                continue;
            }
            match handle.send(&out) {
                Ok(()) => reached += 1,
                Err(ChannelError::Full) => {
                    self.metrics.message_dropped();
                    warn!(
                        endpoint = handle.endpoint(),
                        client_id = %id,
                        "outbound queue full, dropping broadcast"
                    );
                }
                Err(ChannelError::Closed) => stale.push((id, handle)),
            }
        }

        self.evict(stale).await;
        reached
    }

    pub async fn direct(&mut self, msg: serde_json::Value, target_id: ClientId) -> DirectOutcome {
        let endpoint = self.registry.endpoint();

        if let Some(target) = self.registry.get(&target_id).await {
            if target.is_open() {
                let out = ServerMessage::Direct {
                    msg: msg.clone(),
                    from_port: endpoint,
                };
                match target.send(&out) {
                    Ok(()) => {
                        self.metrics.direct_local();
                        debug!(endpoint, target_id = %target_id, "direct message delivered locally");
                        return DirectOutcome::Local;
                    }
                    Err(ChannelError::Full) => {
                        self.metrics.message_dropped();
                        warn!(target_id = %target_id, "outbound queue full, dropping direct message");
                        return DirectOutcome::Dropped;
                    }
                    Err(ChannelError::Closed) => {}
                }
            }
            self.evict(vec![(target_id.clone(), target)]).await;
        }

        let envelope = RelayEnvelope {
            target_id,
            msg,
            from_port: endpoint,
        };
        match self.relay.publish(&envelope).await {
            Ok(()) => DirectOutcome::Relayed,
            Err(e) => {
                warn!(
                    endpoint,
                    target_id = %envelope.target_id,
                    "Dropping direct message, relay unavailable: {}",
                    e
                );
                DirectOutcome::Dropped
            }
        }
    }

    /// Connection closed. Only this connection's own registry entry is removed.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, RouterState::Closed);
        if let RouterState::Registered(id) = previous {
            self.registry.remove_if_owned(&id, self.handle.id()).await;
            info!(
                endpoint = self.registry.endpoint(),
                client_id = %id,
                "Client disconnected"
            );
        } else {
            debug!(
                endpoint = self.registry.endpoint(),
                conn_id = %self.handle.id(),
                "Unregistered connection closed"
            );
        }
    }

    fn send_own(&self, msg: &ServerMessage) {
        if let Err(e) = self.handle.send(msg) {
            debug!(conn_id = %self.handle.id(), "reply not sent: {}", e);
        }
    }

    async fn evict(&self, stale: Vec<(ClientId, ConnectionHandle)>) {
        let mut evicted = 0;
        for (id, handle) in stale {
            if self.registry.remove_if_owned(&id, handle.id()).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.metrics.stale_evicted(evicted);
            debug!(endpoint = self.registry.endpoint(), evicted, "evicted closed connections");
        }
    }
}
