//! Specification compiler backed by Claude.

use async_trait::async_trait;
use botforge_sdk::compiler::{
    FileContent, FilePlan, PlannedFile, RepairPatch, SecretSpec, SetupFiles, SpecCompiler,
};
use botforge_sdk::executor::SourceFile;
use botforge_sdk::{ClientError, ClientResult};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::llm::{LlmClient, extract_json};
use crate::session::ENV_FILE;

/// Keys the build injects on its own; never asked of the user.
const PROVIDED_KEYS: &[&str] = &["BOT_TOKEN"];

/// Build error text beyond this many bytes is cut from the front.
const MAX_TRANSCRIPT: usize = 8_000;

const SYSTEM: &str = "You write production-ready Telegram bots in Python. \
You always answer with exactly one JSON object and nothing else.";

pub struct LlmCompiler {
    llm: LlmClient,
}

impl LlmCompiler {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    async fn ask<T: DeserializeOwned>(&self, prompt: &str, max_tokens: u32) -> ClientResult<T> {
        let reply = self
            .llm
            .complete(SYSTEM, prompt, max_tokens)
            .await
            .map_err(|e| ClientError::Transport(format!("{e:#}")))?;
        parse_reply(&reply)
    }
}

fn parse_reply<T: DeserializeOwned>(reply: &str) -> ClientResult<T> {
    let json = extract_json(reply)
        .ok_or_else(|| ClientError::Decode("reply contains no JSON object".into()))?;
    Ok(serde_json::from_str(json)?)
}

#[derive(Deserialize)]
struct SecretList {
    #[serde(default)]
    secrets: Vec<SecretSpec>,
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl SpecCompiler for LlmCompiler {
    async fn required_secrets(&self, intent: &str) -> ClientResult<Vec<SecretSpec>> {
        let prompt = format!(
            "A user wants this Telegram bot:\n\n{intent}\n\n\
             List the secrets (third-party API keys, passwords, IDs) it needs at runtime, \
             excluding the Telegram bot token. Answer as \
             {{\"secrets\": [{{\"key\": \"UPPER_SNAKE_NAME\", \"description\": \"...\"}}]}}. \
             Use an empty list when none are needed."
        );
        let list: SecretList = self.ask(&prompt, 1024).await?;
        Ok(list
            .secrets
            .into_iter()
            .filter(|s| !PROVIDED_KEYS.contains(&s.key.as_str()))
            .collect())
    }

    async fn plan(&self, intent: &str, library: &str) -> ClientResult<FilePlan> {
        let prompt = format!(
            "Plan the Python project for this Telegram bot using {library}:\n\n{intent}\n\n\
             Do not plan requirements.txt, Dockerfile, docker-compose.yml, README.md or {ENV_FILE}; \
             those are generated separately. Answer as \
             {{\"files\": [{{\"name\": \"main.py\", \"purpose\": \"...\", \"required\": true}}], \
             \"dependencies\": [\"...\"], \"runCommand\": \"python main.py\", \
             \"complexity\": \"low|medium|high\"}}."
        );
        self.ask(&prompt, 2048).await
    }

    async fn content(
        &self,
        intent: &str,
        plan: &FilePlan,
        file: &PlannedFile,
        secret_keys: &[String],
    ) -> ClientResult<FileContent> {
        let others: Vec<String> = plan
            .files
            .iter()
            .map(|f| format!("- {}: {}", f.name, f.purpose))
            .collect();
        let prompt = format!(
            "Bot description:\n{intent}\n\nProject files:\n{}\n\n\
             Write the complete contents of {} ({}). Read the token from the BOT_TOKEN \
             environment variable. Other environment variables available: {}. \
             Answer as {{\"fileName\": \"{}\", \"code\": \"...\", \"notes\": \"...\"}}.",
            others.join("\n"),
            file.name,
            file.purpose,
            if secret_keys.is_empty() { "none".to_string() } else { secret_keys.join(", ") },
            file.name,
        );
        self.ask(&prompt, 8192).await
    }

    async fn setup_files(
        &self,
        intent: &str,
        plan: &FilePlan,
        library: &str,
        secret_keys: &[String],
    ) -> ClientResult<SetupFiles> {
        let prompt = format!(
            "Bot description:\n{intent}\n\nThe bot uses {library}, depends on {:?} and starts with \
             `{}`. Environment variables: BOT_TOKEN {}. Write the packaging files. Answer as \
             {{\"dependencyManifest\": \"<requirements.txt>\", \"containerfile\": \"<Dockerfile>\", \
             \"composeFile\": \"<docker-compose.yml reading {ENV_FILE}>\", \"readme\": \"<README.md>\"}}.",
            plan.dependencies,
            plan.run_command,
            secret_keys.join(" "),
        );
        self.ask(&prompt, 4096).await
    }

    async fn repair(
        &self,
        intent: &str,
        files: &[SourceFile],
        error_transcript: &str,
        library: &str,
    ) -> ClientResult<RepairPatch> {
        let listing: Vec<String> = files
            .iter()
            .filter(|f| f.name != ENV_FILE)
            .map(|f| format!("=== {} ===\n{}", f.name, f.code))
            .collect();
        let prompt = format!(
            "This {library} Telegram bot failed to build.\n\nDescription:\n{intent}\n\n\
             Files:\n{}\n\nBuild error:\n{}\n\n\
             Fix it. Answer as {{\"patchedFiles\": [{{\"name\": \"...\", \"code\": \"<full file>\", \
             \"summary\": \"...\"}}], \"updatedDependencies\": [\"...\"] or null, \
             \"confidence\": 0.0-1.0}}.",
            listing.join("\n\n"),
            tail(error_transcript, MAX_TRANSCRIPT),
        );
        let mut patch: RepairPatch = self.ask(&prompt, 8192).await?;
        patch.confidence = if patch.confidence.is_finite() {
            patch.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Ok(patch)
    }
}
