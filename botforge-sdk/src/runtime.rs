//! Runtime controller: start/stop a built artifact and follow its live output.
//!
//! Restart is not a call of its own; callers stop, wait, then start again.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{ClientError, ClientResult};
use crate::event::LogEntry;
use crate::sse;

/// Live runtime output. Transport errors end the stream; decode errors affect
/// a single entry only.
pub type LogStream = Pin<Box<dyn Stream<Item = ClientResult<LogEntry>> + Send>>;

/// Identity of the running artifact, when the controller reports one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl RuntimeInfo {
    fn from_json(v: &Value) -> Self {
        let field = |key: &str| match v.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Self {
            id: field("id"),
            name: field("name"),
        }
    }
}

#[async_trait]
pub trait RuntimeController: Send + Sync {
    /// Start `image`. Idempotent on the controller side.
    async fn start(&self, image: &str) -> ClientResult<RuntimeInfo>;

    /// Stop whatever is running. Idempotent on the controller side.
    async fn stop(&self) -> ClientResult<()>;

    /// Open the live log stream.
    async fn logs(&self) -> ClientResult<LogStream>;
}

/// Runtime controller reachable over HTTP.
///
/// - `POST {base}/start` with `{"image": …}`, answering `{"id", "name"}`
/// - `POST {base}/stop`
/// - `GET {base}/logs` as server-sent events, one JSON [`LogEntry`] per `data:` line
pub struct HttpRuntimeController {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRuntimeController {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

async fn ensure_success(resp: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RuntimeController for HttpRuntimeController {
    async fn start(&self, image: &str) -> ClientResult<RuntimeInfo> {
        let resp = self
            .http
            .post(self.url("start"))
            .json(&serde_json::json!({ "image": image }))
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        let body = resp.text().await?;
        // Controllers are free to answer with an empty body.
        let info = serde_json::from_str::<Value>(&body)
            .map(|v| RuntimeInfo::from_json(&v))
            .unwrap_or_default();
        Ok(info)
    }

    async fn stop(&self) -> ClientResult<()> {
        let resp = self.http.post(self.url("stop")).send().await?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn logs(&self) -> ClientResult<LogStream> {
        let resp = self
            .http
            .get(self.url("logs"))
            .header("accept", "text/event-stream")
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        let entries = sse::data_lines(resp.bytes_stream()).map(|line| {
            let line = line?;
            serde_json::from_str::<LogEntry>(&line).map_err(ClientError::from)
        });
        Ok(Box::pin(entries))
    }
}
