//! Realtime protocol frames (JSON format).
//!
//! Every WebSocket text frame carries one [`ProtocolMessage`] identified by
//! its numeric `action`. Only the actions this client sends or reacts to
//! are named here.

use serde::{Deserialize, Serialize};

use super::ErrorInfo;
use crate::message::{Message, PresenceMessage};

/// Protocol action codes.
pub mod action {
    /// Keepalive from the server.
    pub const HEARTBEAT: u8 = 0;
    /// Connection established.
    pub const CONNECTED: u8 = 4;
    /// Connection dropped by the server; the client should reconnect.
    pub const DISCONNECTED: u8 = 6;
    /// Client requests a graceful close.
    pub const CLOSE: u8 = 7;
    /// Server confirms the close.
    pub const CLOSED: u8 = 8;
    /// Error; connection-wide when no channel is set.
    pub const ERROR: u8 = 9;
    /// Client requests a channel attachment.
    pub const ATTACH: u8 = 10;
    /// Server confirms a channel attachment.
    pub const ATTACHED: u8 = 11;
    /// Client requests a detach.
    pub const DETACH: u8 = 12;
    /// Channel detached.
    pub const DETACHED: u8 = 13;
    /// Presence updates.
    pub const PRESENCE: u8 = 14;
    /// Channel messages.
    pub const MESSAGE: u8 = 15;
    /// Presence set synchronisation.
    pub const SYNC: u8 = 16;
}

/// Channel attach flag requesting message delivery.
pub const FLAG_SUBSCRIBE: u64 = 1 << 18;

/// Channel attach flag requesting presence delivery.
pub const FLAG_PRESENCE_SUBSCRIBE: u64 = 1 << 19;

/// Details sent with CONNECTED.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Key identifying the connection for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Client id bound to the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Longest gap between frames the server guarantees, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
}

/// One protocol frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// Action code, see [`action`].
    pub action: u8,
    /// Frame id; message ids are derived from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Channel the frame refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Connection id (on CONNECTED and on message frames).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Frame timestamp in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Attach/subscribe flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,
    /// Error details (ERROR, DISCONNECTED, DETACHED).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Messages (MESSAGE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    /// Presence updates (PRESENCE, SYNC).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    /// Connection details (CONNECTED).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
}

impl ProtocolMessage {
    /// ATTACH for `channel`, subscribing to messages and presence.
    pub fn attach(channel: &str) -> Self {
        Self {
            action: action::ATTACH,
            channel: Some(channel.to_string()),
            flags: Some(FLAG_SUBSCRIBE | FLAG_PRESENCE_SUBSCRIBE),
            ..Self::default()
        }
    }

    /// CLOSE for the whole connection.
    pub fn close() -> Self {
        Self {
            action: action::CLOSE,
            ..Self::default()
        }
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialises to a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Takes the messages, filling missing ids, connection ids and
    /// timestamps from the frame.
    pub fn take_messages(&mut self) -> Vec<Message> {
        let mut messages = self.messages.take().unwrap_or_default();
        for (index, message) in messages.iter_mut().enumerate() {
            if message.id.is_none() {
                message.id = self.id.as_ref().map(|id| format!("{id}:{index}"));
            }
            if message.connection_id.is_none() {
                message.connection_id.clone_from(&self.connection_id);
            }
            if message.timestamp == 0 {
                message.timestamp = self.timestamp.unwrap_or_default();
            }
        }
        messages
    }

    /// Takes the presence updates, filling missing fields like
    /// [`take_messages`](Self::take_messages).
    pub fn take_presence(&mut self) -> Vec<PresenceMessage> {
        let mut presence = self.presence.take().unwrap_or_default();
        for (index, member) in presence.iter_mut().enumerate() {
            if member.id.is_none() {
                member.id = self.id.as_ref().map(|id| format!("{id}:{index}"));
            }
            if member.connection_id.is_none() {
                member.connection_id.clone_from(&self.connection_id);
            }
            if member.timestamp == 0 {
                member.timestamp = self.timestamp.unwrap_or_default();
            }
        }
        presence
    }
}
