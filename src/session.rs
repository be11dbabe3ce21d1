//! Channel session: the lifecycle of one channel subscription.
//!
//! ```text
//! Start ─► Connecting ─► Connected ─► Subscribing ─► Listening ─► ShuttingDown ─► Stopped
//!              │                                         │
//!              └────────────────► Failed ◄───────────────┘
//! ```
//!
//! The session owns the connection for the life of the process. It never
//! polls: after subscribing it waits on the client's queues and on the
//! shutdown token. A connection or channel entering `Failed` at any point
//! ends [`ChannelSession::run`] with an error. Decode and render failures
//! stay contained to the event that caused them.
//!
//! # Usage
//!
//! ```ignore
//! let mut session = ChannelSession::builder(Arc::new(config)).build();
//! let mut client = AblyRealtime::from_config(&config);
//! session.run(&mut client, shutdown_token).await?;
//! ```

use std::any::Any;
use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::Level;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::{CLOSE_TIMEOUT, UNNAMED_EVENT};
use crate::diagnostics::{DiagnosticSink, LogSink};
use crate::message::{Message, PresenceMessage};
use crate::realtime::{
    ChannelState, ChannelStateChange, ClientError, ConnectionState, ConnectionStateChange,
    MessagingClient,
};
use crate::render::{render_presence, RenderError, RendererRegistry};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, not running.
    Start,
    /// Waiting for the connection.
    Connecting,
    /// Connection established.
    Connected,
    /// Resolving the channel and registering listeners.
    Subscribing,
    /// Idle, reacting to delivered events.
    Listening,
    /// Closing the connection after a termination request.
    ShuttingDown,
    /// Done.
    Stopped,
    /// Ended by a connection or channel failure.
    Failed,
}

/// Fatal session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection failed or ended unexpectedly.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The channel failed.
    #[error("channel {channel} failed: {reason}")]
    Channel {
        /// Channel name.
        channel: String,
        /// Reported reason.
        reason: String,
    },

    /// The client rejected an operation.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result of handling one delivered event.
#[derive(Debug)]
pub enum Outcome {
    /// Text to print.
    Rendered(String),
    /// Message dropped by the event filter.
    Filtered,
    /// Event seen but nothing to print.
    Observed,
    /// Rendering failed.
    Failed(RenderError),
}

/// Event counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages printed.
    pub rendered: u64,
    /// Messages dropped by the filter.
    pub filtered: u64,
    /// Events whose rendering failed.
    pub failed: u64,
    /// Presence updates received.
    pub presence: u64,
}

/// Builder for [`ChannelSession`].
pub struct ChannelSessionBuilder {
    config: Arc<Config>,
    renderers: Option<RendererRegistry>,
    output: Option<Box<dyn Write + Send>>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl fmt::Debug for ChannelSessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSessionBuilder")
            .field("config", &self.config)
            .field("renderers", &self.renderers)
            .finish_non_exhaustive()
    }
}

impl ChannelSessionBuilder {
    /// Use `renderers` instead of the built-in registry.
    #[must_use]
    pub fn renderers(mut self, renderers: RendererRegistry) -> Self {
        self.renderers = Some(renderers);
        self
    }

    /// Write rendered events to `output` instead of stdout.
    #[must_use]
    pub fn output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// Send diagnostics to `sink` instead of the `log` facade.
    #[must_use]
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Build the session.
    pub fn build(self) -> ChannelSession {
        ChannelSession::new(
            self.config,
            self.renderers
                .unwrap_or_else(RendererRegistry::with_builtin_overrides),
            self.output.unwrap_or_else(|| Box::new(std::io::stdout())),
            self.diagnostics
                .unwrap_or_else(|| Arc::new(LogSink::default())),
        )
    }
}

/// One channel subscription for the life of the process.
pub struct ChannelSession {
    config: Arc<Config>,
    renderers: RendererRegistry,
    output: Box<dyn Write + Send>,
    diagnostics: Arc<dyn DiagnosticSink>,
    phase: SessionPhase,
    stats: SessionStats,
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("config", &self.config)
            .field("renderers", &self.renderers)
            .field("phase", &self.phase)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ChannelSession {
    /// Session writing rendered events to `output`.
    pub fn new(
        config: Arc<Config>,
        renderers: RendererRegistry,
        output: Box<dyn Write + Send>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            config,
            renderers,
            output,
            diagnostics,
            phase: SessionPhase::Start,
            stats: SessionStats::default(),
        }
    }

    /// Start building a session for `config`.
    pub fn builder(config: Arc<Config>) -> ChannelSessionBuilder {
        ChannelSessionBuilder {
            config,
            renderers: None,
            output: None,
            diagnostics: None,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Counters so far.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// The configuration this session runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the session until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Returns `Ok(())` after a graceful shutdown.
    pub async fn run<C>(
        &mut self,
        client: &mut C,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError>
    where
        C: MessagingClient + ?Sized,
    {
        let result = self.drive(client, &shutdown).await;
        if let Err(e) = &result {
            self.set_phase(SessionPhase::Failed);
            self.log(Level::Error, &format!("Session failed: {e}"));
        }
        result
    }

    async fn drive<C>(
        &mut self,
        client: &mut C,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        C: MessagingClient + ?Sized,
    {
        if shutdown.is_cancelled() {
            return self.shut_down(client).await;
        }

        self.set_phase(SessionPhase::Connecting);
        let mut connection = client.connect(&self.config.api_key).await?;

        let connected = loop {
            tokio::select! {
                () = shutdown.cancelled() => break false,
                change = connection.recv() => {
                    let change = change.ok_or_else(connection_ended)?;
                    self.observe_connection(&change)?;
                    if change.current == ConnectionState::Connected {
                        break true;
                    }
                }
            }
        };
        if !connected {
            drop(connection);
            return self.shut_down(client).await;
        }
        self.set_phase(SessionPhase::Connected);

        self.set_phase(SessionPhase::Subscribing);
        let mut feeds = client.channel(&self.config.channel).await?;
        self.log(
            Level::Info,
            &format!(
                "Subscribed to channel {} (event filter: {})",
                self.config.channel, self.config.event_filter
            ),
        );

        self.set_phase(SessionPhase::Listening);
        let (mut states_open, mut messages_open, mut presence_open) = (true, true, true);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                change = connection.recv() => {
                    let change = change.ok_or_else(connection_ended)?;
                    self.observe_connection(&change)?;
                }

                change = feeds.states.recv(), if states_open => match change {
                    Some(change) => self.observe_channel(&change)?,
                    None => states_open = false,
                },

                message = feeds.messages.recv(), if messages_open => match message {
                    Some(message) => self.process_message(&message),
                    None => messages_open = false,
                },

                presence = feeds.presence.recv(), if presence_open => match presence {
                    Some(presence) => self.process_presence(&presence),
                    None => presence_open = false,
                },
            }
        }

        // Nothing reads the queues from here on.
        drop(feeds);
        drop(connection);
        self.shut_down(client).await
    }

    /// Decides what to print for a message: filter, then render through the
    /// registry. Renderer panics are caught and reported as failures.
    pub fn handle_message(&self, message: &Message) -> Outcome {
        if !self.config.accepts_event(message.name()) {
            return Outcome::Filtered;
        }

        let renderer = self.renderers.renderer_for(message.name());
        let debug = self.config.debug;
        match panic::catch_unwind(AssertUnwindSafe(|| renderer.render(message, debug))) {
            Ok(Ok(text)) => Outcome::Rendered(text),
            Ok(Err(e)) => Outcome::Failed(e),
            Err(payload) => Outcome::Failed(RenderError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Decides what to print for a presence update. Filtering never applies.
    pub fn handle_presence(&self, presence: &PresenceMessage) -> Outcome {
        match render_presence(presence, self.config.debug) {
            Ok(Some(text)) => Outcome::Rendered(text),
            Ok(None) => Outcome::Observed,
            Err(e) => Outcome::Failed(e),
        }
    }

    fn process_message(&mut self, message: &Message) {
        let name = message.name().unwrap_or(UNNAMED_EVENT);
        match self.handle_message(message) {
            Outcome::Rendered(text) => match self.emit(&text) {
                Ok(()) => self.stats.rendered += 1,
                Err(e) => self.render_failed(name, &e),
            },
            Outcome::Filtered => {
                self.stats.filtered += 1;
                self.log(
                    Level::Debug,
                    &format!(
                        "Dropped message '{}' (filter: {})",
                        name, self.config.event_filter
                    ),
                );
            }
            Outcome::Observed => {}
            Outcome::Failed(e) => self.render_failed(name, &e),
        }
    }

    fn process_presence(&mut self, presence: &PresenceMessage) {
        self.stats.presence += 1;
        self.log(
            Level::Debug,
            &format!(
                "Presence {} from {} (connection {})",
                presence.action,
                presence.client_id.as_deref().unwrap_or("unknown"),
                presence.connection_id.as_deref().unwrap_or("unknown")
            ),
        );

        match self.handle_presence(presence) {
            Outcome::Rendered(text) => {
                if let Err(e) = self.emit(&text) {
                    self.render_failed("presence", &e);
                }
            }
            Outcome::Failed(e) => self.render_failed("presence", &e),
            Outcome::Filtered | Outcome::Observed => {}
        }
    }

    fn render_failed(&mut self, name: &str, error: &RenderError) {
        self.stats.failed += 1;
        self.log(
            Level::Error,
            &format!("Failed to render event '{name}': {error}"),
        );
        if self.config.debug {
            let detail = format!("Render error for event '{name}': {error}\n  detail: {error:?}\n");
            // Already reported through diagnostics; output may be the thing failing.
            let _ = self.emit(&detail);
        }
    }

    fn emit(&mut self, text: &str) -> Result<(), RenderError> {
        self.output.write_all(text.as_bytes())?;
        self.output.flush()?;
        Ok(())
    }

    fn observe_connection(&self, change: &ConnectionStateChange) -> Result<(), SessionError> {
        let reason = change
            .reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no reason given".to_string());

        match change.current {
            ConnectionState::Failed => Err(SessionError::Connection(reason)),
            ConnectionState::Closed => Err(SessionError::Connection(format!(
                "closed unexpectedly ({reason})"
            ))),
            ConnectionState::Connected => {
                self.log(
                    Level::Info,
                    &format!(
                        "Connection established (id {})",
                        change.connection_id.as_deref().unwrap_or("unknown")
                    ),
                );
                Ok(())
            }
            ConnectionState::Disconnected | ConnectionState::Suspended => {
                self.log(
                    Level::Warn,
                    &format!("Connection {}: {}", change.current, reason),
                );
                Ok(())
            }
            current => {
                self.log(
                    Level::Debug,
                    &format!("Connection state {} -> {}", change.previous, current),
                );
                Ok(())
            }
        }
    }

    fn observe_channel(&self, change: &ChannelStateChange) -> Result<(), SessionError> {
        let reason = change.reason.as_ref().map(ToString::to_string);

        match change.current {
            ChannelState::Failed => Err(SessionError::Channel {
                channel: self.config.channel.clone(),
                reason: reason.unwrap_or_else(|| "no reason given".to_string()),
            }),
            ChannelState::Attached => {
                self.log(
                    Level::Info,
                    &format!("Channel {} attached", self.config.channel),
                );
                Ok(())
            }
            current => {
                let level = match current {
                    ChannelState::Detached | ChannelState::Suspended => Level::Warn,
                    _ => Level::Debug,
                };
                self.log(
                    level,
                    &format!(
                        "Channel {} state {} -> {}{}",
                        self.config.channel,
                        change.previous,
                        current,
                        reason.map(|r| format!(": {r}")).unwrap_or_default()
                    ),
                );
                Ok(())
            }
        }
    }

    async fn shut_down<C>(&mut self, client: &mut C) -> Result<(), SessionError>
    where
        C: MessagingClient + ?Sized,
    {
        self.set_phase(SessionPhase::ShuttingDown);
        self.log(Level::Info, "Shutting down, closing connection");

        match tokio::time::timeout(CLOSE_TIMEOUT, client.close()).await {
            Ok(Ok(())) => self.log(Level::Info, "Connection closed"),
            Ok(Err(e)) => self.log(Level::Warn, &format!("Error closing connection: {e}")),
            Err(_) => self.log(
                Level::Warn,
                &format!(
                    "Connection close timed out after {}s",
                    CLOSE_TIMEOUT.as_secs()
                ),
            ),
        }

        self.set_phase(SessionPhase::Stopped);
        self.log(
            Level::Info,
            &format!(
                "Stopped: {} rendered, {} filtered, {} failed, {} presence",
                self.stats.rendered, self.stats.filtered, self.stats.failed, self.stats.presence
            ),
        );
        Ok(())
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            self.log(
                Level::Debug,
                &format!("Session phase {:?} -> {:?}", self.phase, phase),
            );
            self.phase = phase;
        }
    }

    fn log(&self, level: Level, message: &str) {
        self.diagnostics.record(level, message);
    }
}

fn connection_ended() -> SessionError {
    SessionError::Connection("connection event stream ended".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
