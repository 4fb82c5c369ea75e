//! Errors returned by the collaborator clients.

/// Failure talking to an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The connection could not be established or broke mid-call.
    #[error("transport error: {0}")]
    Transport(String),
    /// The collaborator answered with a non-2xx status. `body` is the raw response text.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// The collaborator understood the request and refused it.
    #[error("{0}")]
    Rejected(String),
    /// The peer violated the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Human-facing message. For HTTP failures this is the response body alone.
    pub fn message(&self) -> String {
        match self {
            ClientError::Http { body, .. } if !body.trim().is_empty() => body.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
