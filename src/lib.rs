//! channel-tail - realtime channel subscriber.
//!
//! Connects to a realtime pub/sub service, subscribes to one channel and
//! prints every delivered message (optionally filtered by event name) as a
//! human-readable block until the process is told to stop.
//!
//! # Architecture
//!
//! - **Config** - command-line flags, read-only after startup
//! - **Session** - owns the connection, filters and renders delivered events
//! - **Render** - pluggable per-event-name renderers
//! - **Realtime** - messaging client trait and the production adapter
//!
//! # Modules
//!
//! - [`config`] - Argument parsing and environment overrides
//! - [`decode`] - Payload decoding (`base64`, JSON, text)
//! - [`render`] - Message and presence rendering
//! - [`session`] - Channel session state machine
//! - [`realtime`] - Messaging client abstraction and realtime adapter

// Library modules
pub mod config;
pub mod constants;
pub mod decode;
pub mod diagnostics;
pub mod message;
pub mod realtime;
pub mod render;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use message::{Message, PresenceAction, PresenceMessage};
pub use realtime::ably::AblyRealtime;
pub use realtime::MessagingClient;
pub use render::{MessageRenderer, RendererRegistry};
pub use session::{ChannelSession, SessionError, SessionPhase};
