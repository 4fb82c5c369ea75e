//! botforge: describe a Telegram bot, get it generated, built and running.
//!
//!   botforge "a bot that replies with the weather for a city" --token 123:abc
//!
//! Runs one session end to end: verifies the token, asks for any secrets the
//! bot needs (pass them with `--secret KEY=VALUE`), generates the project,
//! builds it with up to two automatic repairs, then runs the bot until its
//! time limit. Ctrl+C resets the session and exits.
//!
//! Requires ANTHROPIC_API_KEY environment variable.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use botforge::compiler::LlmCompiler;
use botforge::config::Config;
use botforge::llm::LlmClient;
use botforge::output;
use botforge::runtime_session::RuntimeState;
use botforge::{BuildState, Collaborators, LifecycleError, Orchestrator, StartRequest};
use botforge_sdk::executor::WsBuildTransport;
use botforge_sdk::runtime::HttpRuntimeController;
use botforge_sdk::verifier::{TELEGRAM_API, TelegramVerifier};

#[derive(Parser)]
#[command(name = "botforge", about = "Generate, build and run a Telegram bot from a description")]
struct Args {
    /// What the bot should do
    intent: String,

    /// Telegram bot token (or set BOT_TOKEN env var)
    #[arg(long, env = "BOT_TOKEN")]
    token: String,

    /// Bot framework to generate for
    #[arg(long)]
    library: Option<String>,

    /// Secret the bot needs, as KEY=VALUE (repeatable)
    #[arg(long = "secret", value_parser = parse_secret)]
    secrets: Vec<(String, String)>,

    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    api_key: String,

    /// Claude model to use
    #[arg(long)]
    model: Option<String>,

    /// Build executor WebSocket URL
    #[arg(long)]
    executor_url: Option<String>,

    /// Runtime controller base URL
    #[arg(long)]
    runtime_url: Option<String>,

    /// Config file (default: ~/.config/botforge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_secret(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("secret key is empty".into());
    }
    Ok((key.to_string(), value.to_string()))
}

enum Step<T> {
    Done(T),
    Interrupted,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "botforge=info,botforge_sdk=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let executor_url = args
        .executor_url
        .clone()
        .unwrap_or_else(|| config.executor_url().to_string());
    let runtime_url = args
        .runtime_url
        .clone()
        .unwrap_or_else(|| config.runtime_url().to_string());
    let mut llm = LlmClient::new(args.api_key.clone());
    if let Some(model) = args.model.as_deref().or(config.model.as_deref()) {
        llm = llm.with_model(model);
    }

    tracing::info!(
        executor = %executor_url,
        runtime = %runtime_url,
        model = %llm.model(),
        "Starting botforge"
    );

    let collaborators = Collaborators {
        verifier: Arc::new(TelegramVerifier::with_api_base(
            config.telegram_api.as_deref().unwrap_or(TELEGRAM_API),
        )),
        compiler: Arc::new(LlmCompiler::new(llm)),
        executor: Arc::new(WsBuildTransport::new(executor_url)),
        runtime: Arc::new(HttpRuntimeController::new(runtime_url)),
    };
    let mut orch = Orchestrator::new(collaborators, config.limits());

    let mut events = orch.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            output::print(&event);
        }
    });

    let outcome = run(&mut orch, &args, &config).await;
    orch.reset().await;
    drop(orch);
    let _ = printer.await;
    outcome
}

async fn run(orch: &mut Orchestrator, args: &Args, config: &Config) -> Result<()> {
    let request = StartRequest {
        intent: args.intent.clone(),
        credential: args.token.clone(),
        library: args
            .library
            .clone()
            .or_else(|| config.library.clone())
            .unwrap_or_default(),
    };

    let started = tokio::select! {
        r = orch.start(request) => Step::Done(r),
        _ = tokio::signal::ctrl_c() => Step::Interrupted,
    };
    match started {
        Step::Interrupted => return Ok(()),
        Step::Done(r) => r.context("Session did not start")?,
    }

    if orch.state() == BuildState::GatheringConfig {
        let secrets: BTreeMap<String, String> = args.secrets.iter().cloned().collect();
        let submitted = tokio::select! {
            r = orch.submit_secrets(secrets) => Step::Done(r),
            _ = tokio::signal::ctrl_c() => Step::Interrupted,
        };
        match submitted {
            Step::Interrupted => return Ok(()),
            Step::Done(r) => r.context("Pass the bot's secrets with --secret KEY=VALUE")?,
        }
    }

    let built = tokio::select! {
        r = orch.drive_build() => Step::Done(r),
        _ = tokio::signal::ctrl_c() => Step::Interrupted,
    };
    match built {
        Step::Interrupted => return Ok(()),
        Step::Done(r) => {
            r.context("Build did not succeed")?;
        }
    }

    if orch.runtime_state() != RuntimeState::Running {
        anyhow::bail!("Bot was built but is not running");
    }
    tracing::info!(secs = orch.countdown(), "Bot running. Ctrl+C to stop.");

    while orch.runtime_state() == RuntimeState::Running {
        let next = tokio::select! {
            inbound = orch.next_inbound() => Step::Done(inbound),
            _ = tokio::signal::ctrl_c() => Step::Interrupted,
        };
        let inbound = match next {
            Step::Interrupted => break,
            Step::Done(Some(inbound)) => inbound,
            Step::Done(None) => break,
        };
        match orch.handle(inbound).await {
            Ok(()) => {}
            Err(LifecycleError::StreamDisconnect(reason)) => {
                tracing::warn!(%reason, "Bot stopped after losing its log stream");
            }
            Err(e) => tracing::error!(error = %e, "Event handler error"),
        }
    }
    Ok(())
}
