//! Wire Protocol Types
//!
//! JSON envelopes exchanged with clients over the WebSocket and with other
//! processes over the relay bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Listening endpoints are identified by their port.
pub type EndpointId = u16;

/// Client-supplied identity used for routing. Opaque and never validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Claim an identity on this connection
    #[serde(rename = "setid")]
    Register {
        #[serde(rename = "clientid")]
        client_id: ClientId,
    },
    /// Fan out to every other client on the same endpoint
    #[serde(rename = "bc")]
    Broadcast {
        #[serde(default)]
        msg: Value,
    },
    /// Deliver to one identity, wherever it is connected
    #[serde(rename = "dm")]
    Direct {
        #[serde(default)]
        msg: Value,
        #[serde(rename = "targetid")]
        target_id: ClientId,
    },
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "confirmation")]
    Confirmation { msg: String },
    #[serde(rename = "bc")]
    Broadcast {
        msg: Value,
        /// `None` when the sender never registered
        from: Option<ClientId>,
    },
    #[serde(rename = "dm")]
    Direct {
        msg: Value,
        #[serde(rename = "fromPort")]
        from_port: EndpointId,
    },
}

impl ServerMessage {
    pub fn confirmation(client_id: &ClientId) -> Self {
        Self::Confirmation {
            msg: format!("clientid set to {client_id}"),
        }
    }
}

/// Direct message handed off across processes on the bus topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "targetid")]
    pub target_id: ClientId,
    #[serde(default)]
    pub msg: Value,
    #[serde(rename = "fromPort")]
    pub from_port: EndpointId,
}

impl RelayEnvelope {
    /// The message the holder of `target_id` should receive.
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Direct {
            msg: self.msg.clone(),
            from_port: self.from_port,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("direct message without a target")]
    MissingTarget,
}

/// Decode one inbound text frame.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let msg: ClientMessage = serde_json::from_str(text)?;
    if let ClientMessage::Direct { target_id, .. } = &msg {
        if target_id.is_empty() {
            return Err(ProtocolError::MissingTarget);
        }
    }
    Ok(msg)
}
