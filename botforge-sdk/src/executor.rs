//! Build executor wire contract and its WebSocket transport.
//!
//! One persistent duplex connection per build attempt:
//!
//! - client → server, once, immediately after connecting:
//!   `{"files":[{"name":…,"code":…}],"token":…}`
//! - server → client, zero or more: `{"type":"BUILD_LOG","line":…}`
//! - server → client, exactly one terminal message:
//!   `{"type":"BUILD_DONE","image":…}` or `{"type":"BUILD_ERROR","message":…}`
//!
//! Close codes: [`CLOSE_NORMAL`] on success, [`CLOSE_BUILD_FAILED`] after a
//! failed build, [`CLOSE_CLIENT_TIMEOUT`] when the client gives up waiting.
//!
//! The transport only moves frames. Deciding the outcome of an attempt
//! (watchdog, single resolution, stale connections) is the caller's job.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{ClientError, ClientResult};
use crate::event::ExecutorEvent;

/// Normal closure; the build succeeded.
pub const CLOSE_NORMAL: u16 = 1000;
/// The executor closed after reporting a failed build.
pub const CLOSE_BUILD_FAILED: u16 = 4001;
/// The client closed because its watchdog expired.
pub const CLOSE_CLIENT_TIMEOUT: u16 = 4008;

/// Close code reported when the peer sent a close frame without a status.
const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the stream ended without any close frame.
const CLOSE_ABNORMAL: u16 = 1006;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A named text file as sent to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub code: String,
}

/// The single message a client sends after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub files: Vec<SourceFile>,
    pub token: String,
}

/// Messages the executor pushes to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "BUILD_LOG")]
    BuildLog { line: String },
    #[serde(rename = "BUILD_DONE")]
    BuildDone { image: String },
    #[serde(rename = "BUILD_ERROR")]
    BuildError {
        #[serde(default)]
        message: String,
    },
}

impl From<ServerMessage> for ExecutorEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::BuildLog { line } => ExecutorEvent::Log(line),
            ServerMessage::BuildDone { image } => ExecutorEvent::Done { image },
            ServerMessage::BuildError { message } => ExecutorEvent::Failed { message },
        }
    }
}

/// Decode one text frame from the executor.
pub fn decode_frame(text: &str) -> ClientResult<ServerMessage> {
    serde_json::from_str(text)
        .map_err(|e| ClientError::Protocol(format!("bad executor frame {text:?}: {e}")))
}

/// An open connection to the build executor.
#[async_trait]
pub trait BuildConnection: Send {
    /// Next event in arrival order. `None` once the connection is finished.
    async fn next_event(&mut self) -> Option<ExecutorEvent>;

    /// Close the connection with `code`. Idempotent.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Opens build connections. The request is sent before `open` returns.
#[async_trait]
pub trait BuildTransport: Send + Sync {
    async fn open(&self, request: &BuildRequest) -> ClientResult<Box<dyn BuildConnection>>;
}

/// WebSocket transport to a build executor at a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WsBuildTransport {
    url: String,
}

impl WsBuildTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BuildTransport for WsBuildTransport {
    async fn open(&self, request: &BuildRequest) -> ClientResult<Box<dyn BuildConnection>> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Transport(format!("connect {}: {e}", self.url)))?;

        let payload = serde_json::to_string(request)?;
        ws.send(Message::Text(payload.into()))
            .await
            .map_err(|e| ClientError::Transport(format!("send build request: {e}")))?;

        tracing::debug!(url = %self.url, files = request.files.len(), "Build request sent");
        Ok(Box::new(WsConnection { ws, closed: false }))
    }
}

struct WsConnection {
    ws: WsStream,
    closed: bool,
}

#[async_trait]
impl BuildConnection for WsConnection {
    async fn next_event(&mut self) -> Option<ExecutorEvent> {
        if self.closed {
            return None;
        }
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                    Ok(msg) => return Some(msg.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Ignoring executor frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    return Some(ExecutorEvent::Closed { code, reason });
                }
                // Ping/pong and binary frames carry nothing for us.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(ExecutorEvent::TransportError(e.to_string()));
                }
                None => {
                    self.closed = true;
                    return Some(ExecutorEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "stream ended".to_string(),
                    });
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            tracing::debug!(code, error = %e, "Close handshake failed");
        }
    }
}
