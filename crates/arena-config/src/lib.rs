#![warn(missing_docs)]

//! # arena-config
//!
//! Configuration loading for the arena bot supervisor.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! execution_mode = "child_process"
//! max_heap_mb = 16
//! max_connections = 3
//! callback_timeout_ms = 5000
//!
//! [[bots]]
//! id = "alice"
//! script = "bots/alice.js"
//! endpoint = "ws://127.0.0.1:${ARENA_PORT}/play"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Env var naming the config file.
pub const CONFIG_ENV: &str = "ARENA_CONFIG";

/// Config file used when neither a path nor [`CONFIG_ENV`] is given.
pub const DEFAULT_CONFIG_FILE: &str = "arena.toml";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level arena configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArenaConfig {
    /// Sandbox limits.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Bots to run.
    #[serde(default)]
    pub bots: Vec<BotEntry>,
}

/// One bot in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotEntry {
    /// Unique bot identifier.
    pub id: String,
    /// Path to the bot's script, relative to the config file.
    pub script: PathBuf,
    /// Socket destination handed to the bot.
    pub endpoint: String,
}

/// Sandbox configuration overrides. Unset fields keep the sandbox defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Maximum concurrently live sandboxes.
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// V8 heap ceiling per bot in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum simultaneous connections per bot.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Maximum pending timers per bot.
    #[serde(default)]
    pub max_timers: Option<usize>,

    /// Budget for a bot's top-level source, in seconds.
    #[serde(default)]
    pub setup_timeout_secs: Option<u64>,

    /// Budget for each callback, in milliseconds.
    #[serde(default)]
    pub callback_timeout_ms: Option<u64>,

    /// Liveness probe period in seconds.
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,

    /// Maximum bot source size in kilobytes.
    #[serde(default)]
    pub max_source_kb: Option<usize>,

    /// Treat unhandled promise rejections as fatal.
    #[serde(default)]
    pub fatal_rejections: Option<bool>,
}

impl ArenaConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ArenaConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        Self::from_toml(&expand_env_vars(toml_str))
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// Look up a bot by id.
    pub fn bot(&self, id: &str) -> Option<&BotEntry> {
        self.bots.iter().find(|b| b.id == id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mode) = &self.sandbox.execution_mode {
            if mode != "in_process" && mode != "child_process" {
                return Err(ConfigError::Invalid(format!(
                    "sandbox: unsupported execution_mode '{mode}', supported: in_process, child_process"
                )));
            }
        }
        let positive = [
            ("max_heap_mb", self.sandbox.max_heap_mb.map(|v| v as u64)),
            ("setup_timeout_secs", self.sandbox.setup_timeout_secs),
            ("callback_timeout_ms", self.sandbox.callback_timeout_ms),
            ("ping_interval_secs", self.sandbox.ping_interval_secs),
            ("max_source_kb", self.sandbox.max_source_kb.map(|v| v as u64)),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox: {name} must be greater than zero"
                )));
            }
        }

        let mut seen = HashSet::new();
        for bot in &self.bots {
            if bot.id.trim().is_empty() {
                return Err(ConfigError::Invalid("bot with empty id".into()));
            }
            if !seen.insert(bot.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "bot '{}' is defined more than once",
                    bot.id
                )));
            }
            if bot.script.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "bot '{}': 'script' must not be empty",
                    bot.id
                )));
            }
            if !bot.endpoint.starts_with("ws://") {
                return Err(ConfigError::Invalid(format!(
                    "bot '{}': endpoint must be a ws:// URL, got '{}'",
                    bot.id, bot.endpoint
                )));
            }
        }
        Ok(())
    }
}

/// Where to load the config from: an explicit path, else `$ARENA_CONFIG`,
/// else `./arena.toml`.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

/// Expand `${ENV_VAR}` patterns using the process environment. Unknown
/// variables are left in place.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
