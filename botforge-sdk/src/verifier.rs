//! Bot credential verification.
//!
//! The credential is a Telegram bot token. Verification asks the Bot API who
//! the token belongs to; a rejected token never produces an identity.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

/// Default Telegram Bot API endpoint.
pub const TELEGRAM_API: &str = "https://api.telegram.org";

/// Who a credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: i64,
    pub display_name: String,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Resolve `credential` to an identity, or fail with a descriptive
    /// [`ClientError::Rejected`].
    async fn verify(&self, credential: &str) -> ClientResult<BotIdentity>;
}

/// Verifier backed by the Telegram `getMe` call.
pub struct TelegramVerifier {
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: i64,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl ApiUser {
    fn display_name(&self) -> String {
        match (&self.username, &self.first_name) {
            (Some(u), _) if !u.is_empty() => format!("@{u}"),
            (_, Some(f)) if !f.is_empty() => f.clone(),
            _ => format!("bot {}", self.id),
        }
    }
}

impl TelegramVerifier {
    pub fn new() -> Self {
        Self::with_api_base(TELEGRAM_API)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

impl Default for TelegramVerifier {
    fn default() -> Self {
        Self::new()
    }
}

fn identity_from_reply(reply: ApiReply) -> ClientResult<BotIdentity> {
    if !reply.ok {
        let reason = reply
            .description
            .unwrap_or_else(|| "credential rejected".to_string());
        return Err(ClientError::Rejected(reason));
    }
    let user = reply
        .result
        .ok_or_else(|| ClientError::Protocol("getMe answered ok without a result".to_string()))?;
    Ok(BotIdentity {
        id: user.id,
        display_name: user.display_name(),
    })
}

#[async_trait]
impl CredentialVerifier for TelegramVerifier {
    async fn verify(&self, credential: &str) -> ClientResult<BotIdentity> {
        let url = format!("{}/bot{}/getMe", self.api_base, credential.trim());
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        // Telegram answers 401/404 with a JSON body that explains the rejection.
        match serde_json::from_str::<ApiReply>(&body) {
            Ok(reply) => identity_from_reply(reply),
            Err(_) if !status.is_success() => Err(ClientError::Rejected(format!(
                "credential rejected (HTTP {})",
                status.as_u16()
            ))),
            Err(e) => Err(ClientError::Decode(e.to_string())),
        }
    }
}
