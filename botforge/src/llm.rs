//! Claude API client.
//!
//! Single-turn completions for the specification compiler. Every prompt asks
//! for one JSON object back; [`extract_json`] digs it out of the reply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const ANTHROPIC_API: &str = "https://api.anthropic.com";

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Response from Claude API.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl ApiResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Claude API client.
pub struct LlmClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a conversation to Claude and get a response.
    pub async fn chat(
        &self,
        system: &str,
        messages: &[Message],
        max_tokens: u32,
    ) -> Result<ApiResponse> {
        let body = serde_json::json!({
            "model": &self.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
        });

        let resp = self
            .http
            .post(format!("{ANTHROPIC_API}/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to call Claude API")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {status}: {body}");
        }

        let parsed = resp
            .json::<ApiResponse>()
            .await
            .context("Failed to parse Claude response")?;
        if let Some(usage) = &parsed.usage {
            tracing::debug!(
                model = %self.model,
                input = usage.input_tokens,
                output = usage.output_tokens,
                stop = parsed.stop_reason.as_deref().unwrap_or("-"),
                "Claude call finished"
            );
        }
        Ok(parsed)
    }

    /// Simple single-turn text completion.
    pub async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let messages = vec![Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        let resp = self.chat(system, &messages, max_tokens).await?;
        Ok(resp.text())
    }
}

/// The JSON object in a model reply. Tolerates code fences and prose around it.
pub fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}
