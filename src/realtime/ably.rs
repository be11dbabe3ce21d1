//! Ably realtime adapter.
//!
//! `AblyRealtime` implements [`MessagingClient`] over a single WebSocket
//! speaking the JSON realtime protocol. It covers what a subscriber needs:
//! connect, attach, receive messages and presence, reconnect, close.
//!
//! # Architecture
//!
//! ```text
//! AblyRealtime (handle)
//!     │  commands (attach, close)
//!     ▼
//! ConnectionTask (spawned on connect)
//!     ├── WebSocket (ws module)
//!     ├── Reconnection (exponential backoff with jitter, suspended after 120s)
//!     ├── Liveness check (server idle interval + grace)
//!     └── Per-channel queues ──► session
//! ```
//!
//! A connection-level ERROR, or a handshake the server rejects with a client
//! error, moves the connection to `Failed` and stops the task. Everything
//! else is retried.
//!
//! Queues are bounded. Once `close` starts, a delivery waiting on a full
//! queue is dropped so the CLOSE handshake still goes out, and `close`
//! itself gives up after [`CLIENT_CLOSE_TIMEOUT`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::protocol::{action, ProtocolMessage};
use super::{
    ChannelFeeds, ChannelState, ChannelStateChange, ClientError, ConnectionState,
    ConnectionStateChange, ErrorInfo, MessagingClient,
};
use crate::config::Config;
use crate::constants::{
    CLIENT_CLOSE_TIMEOUT, CLOSE_ACK_TIMEOUT, CONNECT_TIMEOUT, DEFAULT_MAX_IDLE_INTERVAL, EVENT_QUEUE_CAPACITY,
    IDLE_GRACE, INITIAL_BACKOFF, LIVENESS_CHECK_INTERVAL, MAX_BACKOFF, PROTOCOL_VERSION,
    SUSPENDED_AFTER,
};
use crate::message::{Message, PresenceMessage};
use crate::ws::{self, ConnectError, WsMessage, WsReader, WsWriter};

/// Value of the `agent` query parameter.
fn agent() -> String {
    format!("channel-tail/{}", env!("CARGO_PKG_VERSION"))
}

/// Builds the realtime connection URL for `host`.
pub fn realtime_url(host: &str, use_tls: bool, api_key: &str) -> Result<Url, ClientError> {
    let scheme = if use_tls { "wss" } else { "ws" };
    let mut url = Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|e| ClientError::InvalidEndpoint(format!("{host}: {e}")))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ClientError::InvalidEndpoint(format!("{host}: missing host")));
    }

    url.query_pairs_mut()
        .append_pair("key", api_key)
        .append_pair("format", "json")
        .append_pair("v", PROTOCOL_VERSION)
        .append_pair("heartbeats", "true")
        .append_pair("agent", &agent());
    Ok(url)
}

/// Commands from the handle to the connection task.
#[derive(Debug)]
enum Command {
    Attach {
        name: String,
        slot: ChannelSlot,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Sending side of one channel's queues, plus its current state.
#[derive(Debug)]
struct ChannelSlot {
    state: ChannelState,
    states: mpsc::Sender<ChannelStateChange>,
    messages: mpsc::Sender<Message>,
    presence: mpsc::Sender<PresenceMessage>,
}

/// Realtime client handle.
#[derive(Debug)]
pub struct AblyRealtime {
    host: String,
    use_tls: bool,
    commands: Option<mpsc::Sender<Command>>,
    channels: Vec<String>,
    shutdown: CancellationToken,
    closing: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AblyRealtime {
    /// Client for `host` (optionally `host:port`).
    pub fn new(host: impl Into<String>, use_tls: bool) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            host: host.into(),
            use_tls,
            commands: None,
            channels: Vec::new(),
            closing: shutdown.child_token(),
            shutdown,
            task: None,
        }
    }

    /// Client for the endpoint named in `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.realtime_host.clone(), config.use_tls)
    }
}

#[async_trait]
impl MessagingClient for AblyRealtime {
    async fn connect(
        &mut self,
        api_key: &str,
    ) -> Result<mpsc::Receiver<ConnectionStateChange>, ClientError> {
        if self.commands.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let url = realtime_url(&self.host, self.use_tls, api_key)?;
        let (states_tx, states_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let task = ConnectionTask {
            url: url.to_string(),
            host: self.host.clone(),
            state: ConnectionState::Initialized,
            connection_id: None,
            max_idle: DEFAULT_MAX_IDLE_INTERVAL,
            states: states_tx,
            commands: commands_rx,
            channels: HashMap::new(),
            shutdown: self.shutdown.clone(),
            closing: self.closing.clone(),
        };

        log::info!("Connecting to {}", self.host);
        self.task = Some(tokio::spawn(task.run()));
        self.commands = Some(commands_tx);
        Ok(states_rx)
    }

    async fn channel(&mut self, name: &str) -> Result<ChannelFeeds, ClientError> {
        let commands = self.commands.as_ref().ok_or(ClientError::NotConnected)?;
        if self.channels.iter().any(|c| c == name) {
            return Err(ClientError::DuplicateChannel(name.to_string()));
        }

        let (states_tx, states) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (messages_tx, messages) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (presence_tx, presence) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let slot = ChannelSlot {
            state: ChannelState::Initialized,
            states: states_tx,
            messages: messages_tx,
            presence: presence_tx,
        };
        commands
            .send(Command::Attach {
                name: name.to_string(),
                slot,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        self.channels.push(name.to_string());
        Ok(ChannelFeeds {
            states,
            messages,
            presence,
        })
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        let Some(commands) = self.commands.take() else {
            return Ok(());
        };

        // Unblocks deliveries stuck on full queues so the task can see the command.
        self.closing.cancel();

        let (done_tx, done_rx) = oneshot::channel();
        let handshake = async move {
            if commands.send(Command::Close { done: done_tx }).await.is_ok() {
                // The task drops `done` without answering if it stops first.
                let _ = done_rx.await;
            }
        };
        if tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, handshake)
            .await
            .is_err()
        {
            log::warn!("Close handshake with {} timed out", self.host);
        }
        self.shutdown.cancel();

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_ACK_TIMEOUT, &mut task).await.is_err() {
                log::warn!("Connection task did not stop, aborting it");
                task.abort();
            }
        }
        Ok(())
    }
}

impl Drop for AblyRealtime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// How a live connection ended.
#[derive(Debug)]
enum Exit {
    /// Transport lost; reconnect.
    Lost(ErrorInfo),
    /// Permanent failure.
    Failed(ErrorInfo),
    /// Closed on request.
    Closed,
    /// Handle dropped or cancelled.
    Shutdown,
}

/// Result of one connection attempt.
#[derive(Debug)]
enum Attempt {
    Connected {
        writer: WsWriter,
        reader: WsReader,
        frame: ProtocolMessage,
    },
    Retry(ErrorInfo),
    Failed(ErrorInfo),
    Stop,
}

/// Failure while waiting for CONNECTED.
#[derive(Debug)]
enum OpenError {
    Connect(ConnectError),
    Refused(ErrorInfo),
    Lost(ErrorInfo),
}

struct ConnectionTask {
    url: String,
    host: String,
    state: ConnectionState,
    connection_id: Option<String>,
    max_idle: Duration,
    states: mpsc::Sender<ConnectionStateChange>,
    commands: mpsc::Receiver<Command>,
    channels: HashMap<String, ChannelSlot>,
    shutdown: CancellationToken,
    closing: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        let mut offline_since = Instant::now();

        loop {
            self.set_state(ConnectionState::Connecting, None).await;

            let reason = match self.attempt().await {
                Attempt::Connected {
                    mut writer,
                    reader,
                    frame,
                } => {
                    backoff = INITIAL_BACKOFF;
                    self.on_connected(&frame, &mut writer).await;

                    match self.serve(writer, reader).await {
                        Exit::Lost(reason) => {
                            log::warn!("Disconnected from {}: {}", self.host, reason);
                            offline_since = Instant::now();
                            reason
                        }
                        Exit::Failed(reason) => {
                            self.fail(reason).await;
                            return;
                        }
                        Exit::Closed | Exit::Shutdown => return,
                    }
                }
                Attempt::Retry(reason) => {
                    log::warn!("Failed to connect to {}: {}", self.host, reason);
                    reason
                }
                Attempt::Failed(reason) => {
                    self.fail(reason).await;
                    return;
                }
                Attempt::Stop => return,
            };

            if offline_since.elapsed() >= SUSPENDED_AFTER {
                self.set_state(ConnectionState::Suspended, Some(reason)).await;
                self.suspend_channels().await;
            } else {
                self.set_state(ConnectionState::Disconnected, Some(reason)).await;
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % 1000);
            let wait = backoff + jitter;
            log::info!(
                "Reconnecting to {} in {:.1}s...",
                self.host,
                wait.as_secs_f32()
            );
            if !self.wait_offline(wait).await {
                return;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One connection attempt, still answering commands meanwhile.
    async fn attempt(&mut self) -> Attempt {
        let open = open_transport(self.url.clone());
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => {
                    return match result {
                        Ok((writer, reader, frame)) => Attempt::Connected { writer, reader, frame },
                        Err(OpenError::Connect(e)) if e.is_permanent() => {
                            Attempt::Failed(ErrorInfo::local(e.to_string()))
                        }
                        Err(OpenError::Connect(e)) => Attempt::Retry(ErrorInfo::local(e.to_string())),
                        Err(OpenError::Refused(info)) => Attempt::Failed(info),
                        Err(OpenError::Lost(info)) => Attempt::Retry(info),
                    };
                }
                Some(command) = self.commands.recv() => {
                    if !self.handle_offline_command(command).await {
                        return Attempt::Stop;
                    }
                }
                () = self.shutdown.cancelled() => return Attempt::Stop,
            }
        }
    }

    /// Waits out a backoff period. Returns `false` if the task should stop.
    async fn wait_offline(&mut self, wait: Duration) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,
                Some(command) = self.commands.recv() => {
                    if !self.handle_offline_command(command).await {
                        return false;
                    }
                }
                () = self.shutdown.cancelled() => return false,
            }
        }
    }

    /// Handles a command while no socket is open. Returns `false` on close.
    async fn handle_offline_command(&mut self, command: Command) -> bool {
        match command {
            Command::Attach { name, slot } => {
                self.channels.insert(name.clone(), slot);
                self.set_channel_state(&name, ChannelState::Attaching, None)
                    .await;
                true
            }
            Command::Close { done } => {
                self.set_state(ConnectionState::Closed, None).await;
                let _ = done.send(());
                false
            }
        }
    }

    async fn on_connected(&mut self, frame: &ProtocolMessage, writer: &mut WsWriter) {
        self.connection_id.clone_from(&frame.connection_id);
        if let Some(idle) = frame
            .connection_details
            .as_ref()
            .and_then(|d| d.max_idle_interval)
            .filter(|ms| *ms > 0)
        {
            self.max_idle = Duration::from_millis(idle);
        }

        let change = ConnectionStateChange {
            previous: self.state,
            current: ConnectionState::Connected,
            reason: None,
            connection_id: self.connection_id.clone(),
        };
        self.state = ConnectionState::Connected;
        log::info!(
            "Connected to {} (connection {})",
            self.host,
            self.connection_id.as_deref().unwrap_or("unknown")
        );
        deliver(&self.states, change, &self.closing).await;

        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            self.send_attach(&name, writer).await;
        }
    }

    /// Runs a live connection until it ends.
    async fn serve(&mut self, mut writer: WsWriter, mut reader: WsReader) -> Exit {
        let mut last_activity = Instant::now();
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = writer.close().await;
                    return Exit::Shutdown;
                }

                Some(command) = self.commands.recv() => match command {
                    Command::Attach { name, slot } => {
                        self.channels.insert(name.clone(), slot);
                        self.send_attach(&name, &mut writer).await;
                    }
                    Command::Close { done } => {
                        self.close_gracefully(&mut writer, &mut reader).await;
                        let _ = done.send(());
                        return Exit::Closed;
                    }
                },

                frame = reader.recv() => {
                    last_activity = Instant::now();
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(exit) = self.handle_frame(&text, &mut writer).await {
                                let _ = writer.close().await;
                                return exit;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if writer.send_pong(data).await.is_err() {
                                return Exit::Lost(ErrorInfo::local("failed to send pong"));
                            }
                        }
                        Some(Ok(WsMessage::Close { code, reason })) => {
                            return Exit::Lost(ErrorInfo::local(format!(
                                "WebSocket closed by server ({code}) {reason}"
                            )));
                        }
                        Some(Ok(WsMessage::Binary(_) | WsMessage::Pong(_))) => {}
                        Some(Err(e)) => return Exit::Lost(ErrorInfo::local(e.to_string())),
                        None => return Exit::Lost(ErrorInfo::local("WebSocket stream ended")),
                    }
                }

                _ = liveness.tick() => {
                    if last_activity.elapsed() > self.max_idle + IDLE_GRACE {
                        return Exit::Lost(ErrorInfo::local(format!(
                            "connection stale ({}s without activity)",
                            last_activity.elapsed().as_secs()
                        )));
                    }
                }
            }
        }
    }

    /// Handles one protocol frame. Returns `Some` if the connection ends.
    async fn handle_frame(&mut self, text: &str, writer: &mut WsWriter) -> Option<Exit> {
        let mut frame = match ProtocolMessage::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Ignoring unparseable frame: {}", e);
                return None;
            }
        };

        match frame.action {
            action::HEARTBEAT => {}
            action::CONNECTED => {
                // Sent again after an in-place reauthorisation.
                self.connection_id.clone_from(&frame.connection_id);
            }
            action::DISCONNECTED => {
                return Some(Exit::Lost(
                    frame
                        .error
                        .unwrap_or_else(|| ErrorInfo::local("disconnected by server")),
                ));
            }
            action::CLOSED => {
                return Some(Exit::Lost(ErrorInfo::local("closed by server")));
            }
            action::ERROR => {
                let error = frame
                    .error
                    .unwrap_or_else(|| ErrorInfo::local("unspecified error"));
                match frame.channel {
                    Some(channel) => {
                        self.set_channel_state(&channel, ChannelState::Failed, Some(error))
                            .await;
                    }
                    None => return Some(Exit::Failed(error)),
                }
            }
            action::ATTACHED => {
                if let Some(channel) = frame.channel.as_deref() {
                    self.set_channel_state(channel, ChannelState::Attached, frame.error)
                        .await;
                }
            }
            action::DETACHED => {
                if let Some(channel) = frame.channel {
                    log::warn!(
                        "Channel {} detached by server{}, reattaching",
                        channel,
                        frame
                            .error
                            .as_ref()
                            .map(|e| format!(": {e}"))
                            .unwrap_or_default()
                    );
                    self.set_channel_state(&channel, ChannelState::Detached, frame.error)
                        .await;
                    self.send_attach(&channel, writer).await;
                }
            }
            action::MESSAGE => self.deliver_messages(&mut frame).await,
            action::PRESENCE | action::SYNC => self.deliver_presence(&mut frame).await,
            other => log::trace!("Ignoring protocol action {}", other),
        }
        None
    }

    async fn deliver_messages(&mut self, frame: &mut ProtocolMessage) {
        let messages = frame.take_messages();
        let Some(slot) = frame.channel.as_deref().and_then(|c| self.channels.get(c)) else {
            log::debug!("Dropping {} message(s) for unknown channel", messages.len());
            return;
        };
        let total = messages.len();
        for (delivered, message) in messages.into_iter().enumerate() {
            if !deliver(&slot.messages, message, &self.closing).await {
                log::debug!("Dropped {} undelivered message(s)", total - delivered);
                return;
            }
        }
    }

    async fn deliver_presence(&mut self, frame: &mut ProtocolMessage) {
        let presence = frame.take_presence();
        let Some(slot) = frame.channel.as_deref().and_then(|c| self.channels.get(c)) else {
            log::debug!("Dropping {} presence update(s) for unknown channel", presence.len());
            return;
        };
        let total = presence.len();
        for (delivered, member) in presence.into_iter().enumerate() {
            if !deliver(&slot.presence, member, &self.closing).await {
                log::debug!("Dropped {} undelivered presence update(s)", total - delivered);
                return;
            }
        }
    }

    async fn send_attach(&mut self, name: &str, writer: &mut WsWriter) {
        self.set_channel_state(name, ChannelState::Attaching, None)
            .await;
        match ProtocolMessage::attach(name).to_json() {
            Ok(json) => {
                if let Err(e) = writer.send_text(&json).await {
                    log::warn!("Failed to send ATTACH for {}: {}", name, e);
                }
            }
            Err(e) => log::error!("Failed to encode ATTACH for {}: {}", name, e),
        }
    }

    async fn close_gracefully(&mut self, writer: &mut WsWriter, reader: &mut WsReader) {
        self.set_state(ConnectionState::Closing, None).await;

        match ProtocolMessage::close().to_json() {
            Ok(json) => {
                if let Err(e) = writer.send_text(&json).await {
                    log::debug!("Failed to send CLOSE: {}", e);
                }
            }
            Err(e) => log::error!("Failed to encode CLOSE: {}", e),
        }

        let acknowledged = tokio::time::timeout(CLOSE_ACK_TIMEOUT, async {
            while let Some(Ok(frame)) = reader.recv().await {
                if let WsMessage::Text(text) = frame {
                    if ProtocolMessage::parse(&text).is_ok_and(|f| f.action == action::CLOSED) {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if !acknowledged {
            log::debug!("No CLOSED acknowledgement from {}", self.host);
        }
        let _ = writer.close().await;
        self.set_state(ConnectionState::Closed, None).await;
    }

    async fn fail(&mut self, reason: ErrorInfo) {
        log::error!("Connection to {} failed: {}", self.host, reason);
        self.set_state(ConnectionState::Failed, Some(reason)).await;
    }

    async fn suspend_channels(&mut self) {
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            self.set_channel_state(&name, ChannelState::Suspended, None)
                .await;
        }
    }

    async fn set_state(&mut self, current: ConnectionState, reason: Option<ErrorInfo>) {
        if self.state == current && reason.is_none() {
            return;
        }
        let change = ConnectionStateChange {
            previous: self.state,
            current,
            reason,
            connection_id: self.connection_id.clone(),
        };
        log::debug!("Connection state {} -> {}", change.previous, change.current);
        self.state = current;
        deliver(&self.states, change, &self.closing).await;
    }

    async fn set_channel_state(
        &mut self,
        name: &str,
        current: ChannelState,
        reason: Option<ErrorInfo>,
    ) {
        let Some(slot) = self.channels.get_mut(name) else {
            log::debug!("State {} for unknown channel {}", current, name);
            return;
        };
        if slot.state == current && reason.is_none() {
            return;
        }
        let change = ChannelStateChange {
            previous: slot.state,
            current,
            reason,
        };
        log::debug!("Channel {} state {} -> {}", name, change.previous, change.current);
        slot.state = current;
        deliver(&slot.states, change, &self.closing).await;
    }
}

/// Queues `item` for the session.
///
/// Waits for capacity until `closing` is cancelled, after which a full queue
/// drops the item. Returns `false` if the item was not queued.
async fn deliver<T: Send>(queue: &mpsc::Sender<T>, item: T, closing: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        sent = queue.send(item) => sent.is_ok(),
        () = closing.cancelled() => false,
    }
}

/// Opens the socket and waits for CONNECTED.
async fn open_transport(
    url: String,
) -> Result<(WsWriter, WsReader, ProtocolMessage), OpenError> {
    let (writer, mut reader) = ws::connect(&url).await.map_err(OpenError::Connect)?;

    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while let Some(frame) = reader.recv().await {
            match frame {
                Ok(WsMessage::Text(text)) => match ProtocolMessage::parse(&text) {
                    Ok(frame) if frame.action == action::CONNECTED => return Ok(frame),
                    Ok(frame) if frame.action == action::ERROR => {
                        return Err(OpenError::Refused(
                            frame
                                .error
                                .unwrap_or_else(|| ErrorInfo::local("connection refused")),
                        ));
                    }
                    Ok(frame) if frame.action == action::DISCONNECTED => {
                        return Err(OpenError::Lost(frame.error.unwrap_or_else(|| {
                            ErrorInfo::local("disconnected before CONNECTED")
                        })));
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Ignoring unparseable frame: {}", e),
                },
                Ok(WsMessage::Close { code, reason }) => {
                    return Err(OpenError::Lost(ErrorInfo::local(format!(
                        "WebSocket closed before CONNECTED ({code}) {reason}"
                    ))));
                }
                Ok(_) => {}
                Err(e) => return Err(OpenError::Lost(ErrorInfo::local(e.to_string()))),
            }
        }
        Err(OpenError::Lost(ErrorInfo::local(
            "WebSocket closed before CONNECTED",
        )))
    })
    .await
    .unwrap_or_else(|_| {
        Err(OpenError::Lost(ErrorInfo::local(
            "timed out waiting for CONNECTED",
        )))
    })?;

    Ok((writer, reader, connected))
}
