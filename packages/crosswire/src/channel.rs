//! Connection handles
//!
//! A [`ConnectionHandle`] is the routing-side view of one accepted WebSocket:
//! a bounded outbound queue plus an open flag. The socket side is driven by
//! [`drain_outbound`], which owns the write half for the connection's lifetime.

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::protocol::{EndpointId, ServerMessage};

/// Unique per accepted connection, independent of the client's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("connection is closed")]
    Closed,

    #[error("outbound queue is full")]
    Full,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    endpoint: EndpointId,
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(endpoint: EndpointId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            endpoint,
            tx,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Queue a message without waiting. A full queue drops the message.
    pub fn send(&self, msg: &ServerMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        match self.tx.try_send(msg.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChannelError::Full),
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Mark the connection closed. Safe to call more than once.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Write queued messages to the socket until the handle closes or the peer goes away.
pub(crate) async fn drain_outbound<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ServerMessage>,
    closed: CancellationToken,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            next = rx.recv() => match next {
                Some(msg) => msg,
                None => break,
            },
        };

        let json = match serde_json::to_string(&msg) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            debug!("socket write failed, closing connection");
            break;
        }
    }

    closed.cancel();
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as futures_mpsc;
    use futures::StreamExt;
    use serde_json::json;

    fn hello() -> ServerMessage {
        ServerMessage::Confirmation {
            msg: "hello".into(),
        }
    }

    #[test]
    fn send_queues_while_open() {
        let (handle, mut rx) = ConnectionHandle::new(4000, 4);
        assert!(handle.is_open());
        handle.send(&hello()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), hello());
    }

    #[test]
    fn send_after_close_fails() {
        let (handle, _rx) = ConnectionHandle::new(4000, 4);
        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert_eq!(handle.send(&hello()), Err(ChannelError::Closed));
    }

    #[test]
    fn dropped_receiver_reads_as_closed() {
        let (handle, rx) = ConnectionHandle::new(4000, 4);
        drop(rx);
        assert!(!handle.is_open());
        assert_eq!(handle.send(&hello()), Err(ChannelError::Closed));
    }

    #[test]
    fn full_queue_rejects_without_closing() {
        let (handle, _rx) = ConnectionHandle::new(4000, 1);
        handle.send(&hello()).unwrap();
        assert_eq!(handle.send(&hello()), Err(ChannelError::Full));
        assert!(handle.is_open());
    }

    #[test]
    fn clones_share_open_state() {
        let (handle, _rx) = ConnectionHandle::new(4000, 1);
        let other = handle.clone();
        assert_eq!(handle.id(), other.id());
        other.close();
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn drain_writes_json_frames_in_order() {
        let (handle, rx) = ConnectionHandle::new(4000, 8);
        let (sink, mut frames) = futures_mpsc::unbounded::<Message>();
        let writer = tokio::spawn(drain_outbound(sink, rx, handle.closed_token()));

        handle.send(&hello()).unwrap();
        handle
            .send(&ServerMessage::Direct {
                msg: json!("hi"),
                from_port: 4001,
            })
            .unwrap();

        let first = frames.next().await.unwrap();
        let second = frames.next().await.unwrap();
        let Message::Text(first) = first else {
            panic!("expected text frame")
        };
        let Message::Text(second) = second else {
            panic!("expected text frame")
        };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(first.as_str()).unwrap(),
            json!({"type": "confirmation", "msg": "hello"})
        );
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(second.as_str()).unwrap(),
            json!({"type": "dm", "msg": "hi", "fromPort": 4001})
        );

        handle.close();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn failed_write_marks_handle_closed() {
        let (handle, rx) = ConnectionHandle::new(4000, 8);
        let (sink, frames) = futures_mpsc::unbounded::<Message>();
        drop(frames);
        let writer = tokio::spawn(drain_outbound(sink, rx, handle.closed_token()));

        handle.send(&hello()).unwrap();
        writer.await.unwrap();
        assert!(!handle.is_open());
    }
}
