//! Persistent configuration for botforge.
//!
//! Config file lives at `~/.config/botforge/config.toml`. Every field is
//! optional; command-line flags win over the file, the file over defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::Limits;

/// Default build executor endpoint.
pub const DEFAULT_EXECUTOR_URL: &str = "ws://localhost:8000/ws/build";
/// Default runtime controller base URL.
pub const DEFAULT_RUNTIME_URL: &str = "http://localhost:8000/runtime";

/// User configuration (persisted in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Build executor WebSocket URL.
    pub executor_url: Option<String>,
    /// Runtime controller base URL.
    pub runtime_url: Option<String>,
    /// Telegram Bot API base, for self-hosted API servers.
    pub telegram_api: Option<String>,
    /// Claude model used for generation and repair.
    pub model: Option<String>,
    /// Default bot framework.
    pub library: Option<String>,
    /// Seconds a single build may take.
    pub watchdog_secs: Option<u64>,
    /// Seconds a started bot keeps running.
    pub runtime_secs: Option<u64>,
    /// Milliseconds between stop and start on restart.
    pub restart_delay_ms: Option<u64>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("botforge")
}

pub fn default_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl Config {
    /// Load from `path`, or the default location. A missing file yields defaults;
    /// an unreadable or malformed one is reported and ignored.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(s) => match toml::from_str(&s) {
                Ok(c) => return c,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Bad config file"),
            },
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Can't read config"),
        }
        Self::default()
    }

    pub fn executor_url(&self) -> &str {
        self.executor_url.as_deref().unwrap_or(DEFAULT_EXECUTOR_URL)
    }

    pub fn runtime_url(&self) -> &str {
        self.runtime_url.as_deref().unwrap_or(DEFAULT_RUNTIME_URL)
    }

    /// Timing bounds with unset fields at their defaults.
    pub fn limits(&self) -> Limits {
        let defaults = Limits::default();
        Limits {
            watchdog: self
                .watchdog_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.watchdog),
            runtime_duration: self
                .runtime_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.runtime_duration),
            restart_delay: self
                .restart_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.restart_delay),
        }
    }
}
