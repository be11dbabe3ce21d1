//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves, so the realtime adapter never touches
//! `tokio-tungstenite` types directly.
//!
//! [`connect`] performs the handshake and classifies failures: a handshake
//! the server rejects with a client error is permanent, anything else is
//! worth retrying.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Failure to establish a WebSocket connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The URL could not be turned into a handshake request.
    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    /// The server answered the upgrade request with an HTTP error.
    #[error("handshake rejected with HTTP {status}")]
    Rejected {
        /// HTTP status code of the response.
        status: u16,
    },

    /// Network, TLS or protocol failure.
    #[error("WebSocket connect failed: {0}")]
    Transport(String),
}

impl ConnectError {
    /// Returns `true` if retrying the same request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::InvalidUrl(_) => true,
            Self::Rejected { status } => (400..500).contains(status) && !matches!(status, 408 | 429),
            Self::Transport(_) => false,
        }
    }
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a pong frame in response to a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Flush pending writes and close the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => WsMessage::Text(text.to_string()),
                Ok(tungstenite::Message::Binary(data)) => WsMessage::Binary(data.to_vec()),
                Ok(tungstenite::Message::Ping(data)) => WsMessage::Ping(data.to_vec()),
                Ok(tungstenite::Message::Pong(data)) => WsMessage::Pong(data.to_vec()),
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    WsMessage::Close { code, reason }
                }
                Ok(tungstenite::Message::Frame(_)) => continue,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            return Some(Ok(message));
        }
    }
}

/// Connect to a WebSocket URL.
///
/// Returns split (writer, reader) halves for independent use in
/// `tokio::select!` loops.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader), ConnectError> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(classify)?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

fn classify(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response) => ConnectError::Rejected {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Url(e) => ConnectError::InvalidUrl(e.to_string()),
        other => ConnectError::Transport(other.to_string()),
    }
}
