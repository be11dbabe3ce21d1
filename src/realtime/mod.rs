//! Messaging client abstraction.
//!
//! The session talks to the realtime service only through the
//! [`MessagingClient`] trait. Implementations push everything they observe
//! into bounded queues; the session consumes those queues.
//!
//! # Architecture
//!
//! ```text
//! MessagingClient (trait)
//!     │
//!     ├── connect(api_key) ──► Receiver<ConnectionStateChange>
//!     │
//!     ├── channel(name)    ──► ChannelFeeds
//!     │                          ├── states:   Receiver<ChannelStateChange>
//!     │                          ├── messages: Receiver<Message>
//!     │                          └── presence: Receiver<PresenceMessage>
//!     │
//!     └── close()
//! ```
//!
//! [`ably::AblyRealtime`] is the production implementation.

pub mod ably;
pub mod protocol;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{Message, PresenceMessage};

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Created, not yet connecting.
    #[default]
    Initialized,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Temporarily disconnected; the client is retrying.
    Disconnected,
    /// Disconnected for a long time; the client keeps retrying less eagerly.
    Suspended,
    /// Close requested.
    Closing,
    /// Closed on request.
    Closed,
    /// Permanent failure. The client will not retry.
    Failed,
}

impl ConnectionState {
    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Created, not yet attaching.
    #[default]
    Initialized,
    /// Attach requested.
    Attaching,
    /// Attached; messages flow.
    Attached,
    /// Detach requested.
    Detaching,
    /// Detached.
    Detached,
    /// Attachment lost while the connection is suspended.
    Suspended,
    /// Permanent failure.
    Failed,
}

impl ChannelState {
    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Detached => "detached",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error details reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Service error code, e.g. `40101`.
    #[serde(default)]
    pub code: u32,
    /// HTTP-equivalent status code.
    #[serde(default)]
    pub status_code: u16,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Error raised locally rather than reported by the service.
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            status_code: 0,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            f.write_str(&self.message)
        } else {
            write!(f, "{} (code {}, status {})", self.message, self.code, self.status_code)
        }
    }
}

/// A connection state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChange {
    /// State before the change.
    pub previous: ConnectionState,
    /// State after the change.
    pub current: ConnectionState,
    /// Why the change happened, if known.
    pub reason: Option<ErrorInfo>,
    /// Connection id assigned by the service (set once connected).
    pub connection_id: Option<String>,
}

impl ConnectionStateChange {
    /// Transition without extra details.
    pub fn new(previous: ConnectionState, current: ConnectionState) -> Self {
        Self {
            previous,
            current,
            reason: None,
            connection_id: None,
        }
    }

    /// Attaches a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: ErrorInfo) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// A channel state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStateChange {
    /// State before the change.
    pub previous: ChannelState,
    /// State after the change.
    pub current: ChannelState,
    /// Why the change happened, if known.
    pub reason: Option<ErrorInfo>,
}

impl ChannelStateChange {
    /// Transition without a reason.
    pub fn new(previous: ChannelState, current: ChannelState) -> Self {
        Self {
            previous,
            current,
            reason: None,
        }
    }

    /// Attaches a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: ErrorInfo) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Receivers for everything delivered on one channel.
#[derive(Debug)]
pub struct ChannelFeeds {
    /// Channel state changes.
    pub states: mpsc::Receiver<ChannelStateChange>,
    /// Channel messages, unfiltered.
    pub messages: mpsc::Receiver<Message>,
    /// Presence updates.
    pub presence: mpsc::Receiver<PresenceMessage>,
}

/// Errors returned by [`MessagingClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint could not be turned into a valid URL.
    #[error("invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),

    /// An operation needed a connection that has not been opened.
    #[error("not connected")]
    NotConnected,

    /// The connection task has stopped.
    #[error("connection closed")]
    Closed,

    /// The client was asked to connect twice.
    #[error("already connected")]
    AlreadyConnected,

    /// The channel was already resolved.
    #[error("channel {0} already subscribed")]
    DuplicateChannel(String),
}

/// Connection to a realtime messaging service.
///
/// Implementations deliver state changes and events through bounded queues
/// and never block the caller while doing so.
#[async_trait]
pub trait MessagingClient: Send {
    /// Opens the connection.
    ///
    /// Returns immediately; progress is reported on the returned receiver
    /// for the life of the connection.
    async fn connect(
        &mut self,
        api_key: &str,
    ) -> Result<mpsc::Receiver<ConnectionStateChange>, ClientError>;

    /// Resolves `name` and starts attaching to it.
    async fn channel(&mut self, name: &str) -> Result<ChannelFeeds, ClientError>;

    /// Closes the connection gracefully.
    async fn close(&mut self) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_display() {
        let info = ErrorInfo {
            code: 40101,
            status_code: 401,
            message: "Invalid credentials".to_string(),
        };
        assert_eq!(
            info.to_string(),
            "Invalid credentials (code 40101, status 401)"
        );
        assert_eq!(ErrorInfo::local("socket closed").to_string(), "socket closed");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
        assert_eq!(ChannelState::Attached.to_string(), "attached");
        assert_eq!(ConnectionState::default(), ConnectionState::Initialized);
    }

    #[test]
    fn test_state_change_with_reason() {
        let change = ConnectionStateChange::new(ConnectionState::Connected, ConnectionState::Failed)
            .with_reason(ErrorInfo::local("boom"));
        assert_eq!(change.reason.unwrap().message, "boom");
        assert!(change.connection_id.is_none());
    }
}
