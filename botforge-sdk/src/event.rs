//! Log entries and executor events that the clients hand to the consumer.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Kind of a log line. Serialized as the lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Error,
    User,
    Bot,
    Raw,
}

/// A single line in the build or runtime log.
///
/// The runtime log stream sends these as JSON with `timestamp` as an ISO-8601
/// string; it is converted to local time on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: DateTime<Local>,
    #[serde(rename = "type")]
    pub kind: LogKind,
}

impl LogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Local::now(),
            kind,
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::new(LogKind::Log, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogKind::Error, message)
    }

    pub fn bot(message: impl Into<String>) -> Self {
        Self::new(LogKind::Bot, message)
    }

    pub fn raw(message: impl Into<String>) -> Self {
        Self::new(LogKind::Raw, message)
    }
}

/// What a build connection yields, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    /// Intermediate progress line (`BUILD_LOG`).
    Log(String),
    /// Terminal success (`BUILD_DONE`) naming the built image.
    Done { image: String },
    /// Terminal failure (`BUILD_ERROR`). The executor may leave `message` empty.
    Failed { message: String },
    /// The connection closed with the given code.
    Closed { code: u16, reason: String },
    /// The transport broke without a close handshake.
    TransportError(String),
}
