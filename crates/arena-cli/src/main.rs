#![warn(missing_docs)]

//! Arena supervisor.
//!
//! Loads the bot registry from `arena.toml`, starts every bot in its own
//! sandbox, logs the merged event stream, and stops all bots on Ctrl-C or
//! SIGTERM.
//!
//! ```text
//! arena [--config <path>] [--metrics]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use arena_config::{ArenaConfig, BotEntry};
use arena_sandbox::events::GuestLogLevel;
use arena_sandbox::{
    BotRegistry, BotRequest, EventKind, ExecutionMode, SandboxConfig, SandboxError, SandboxEvent,
    SandboxHandle, SandboxManager, ScriptSource,
};
use tracing_subscriber::EnvFilter;

/// Extra time allowed for bots to report termination after a shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Arena supervisor: runs every configured bot in its own sandbox.
#[derive(Debug, Parser)]
#[command(name = "arena", version, about, long_about = None)]
struct Cli {
    /// Path to the arena config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics to stdout on exit
    #[arg(long)]
    metrics: bool,
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &arena_config::SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(ref mode) = overrides.execution_mode {
        config.execution_mode = match mode.as_str() {
            "child_process" => ExecutionMode::ChildProcess,
            _ => ExecutionMode::InProcess,
        };
    }
    if let Some(workers) = overrides.max_workers {
        config.max_workers = workers;
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(connections) = overrides.max_connections {
        config.max_connections = connections;
    }
    if let Some(timers) = overrides.max_timers {
        config.max_timers = timers;
    }
    if let Some(secs) = overrides.setup_timeout_secs {
        config.setup_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = overrides.callback_timeout_ms {
        config.callback_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = overrides.ping_interval_secs {
        config.ping_interval = Duration::from_secs(secs);
    }
    if let Some(kb) = overrides.max_source_kb {
        config.max_source_size = kb * 1024;
    }
    if let Some(fatal) = overrides.fatal_rejections {
        config.fatal_rejections = fatal;
    }
    config
}

/// Bot registry backed by the `[[bots]]` table of the config file.
struct ConfigRegistry {
    bots: HashMap<String, BotEntry>,
    base_dir: PathBuf,
}

impl ConfigRegistry {
    fn new(config: &ArenaConfig, config_path: &Path) -> Self {
        let base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let bots = config
            .bots
            .iter()
            .map(|b| (b.id.clone(), b.clone()))
            .collect();
        Self { bots, base_dir }
    }
}

#[async_trait::async_trait]
impl BotRegistry for ConfigRegistry {
    async fn lookup(&self, bot_id: &str) -> Result<BotRequest, SandboxError> {
        let entry = self
            .bots
            .get(bot_id)
            .ok_or_else(|| SandboxError::UnknownBot(bot_id.to_string()))?;
        Ok(BotRequest {
            bot_id: entry.id.clone(),
            source: ScriptSource::Path(self.base_dir.join(&entry.script)),
            endpoint: entry.endpoint.clone(),
        })
    }
}

fn log_event(event: &SandboxEvent) {
    let bot = event.bot_id.as_str();
    match &event.kind {
        EventKind::Log { level, text } => match level {
            GuestLogLevel::Debug => tracing::debug!(target: "arena::bot", bot, "{text}"),
            GuestLogLevel::Info => tracing::info!(target: "arena::bot", bot, "{text}"),
            GuestLogLevel::Warn => tracing::warn!(target: "arena::bot", bot, "{text}"),
            GuestLogLevel::Error => tracing::error!(target: "arena::bot", bot, "{text}"),
        },
        EventKind::Error { message, fatal } => {
            tracing::warn!(target: "arena::events", bot, fatal, "{message}")
        }
        EventKind::Status { state, teardown } => match teardown {
            Some(report) => tracing::info!(
                target: "arena::events",
                bot,
                state = ?state,
                connections_closed = report.connections_closed,
                timers_cleared = report.timers_cleared,
                "status"
            ),
            None => tracing::info!(target: "arena::events", bot, state = ?state, "status"),
        },
        EventKind::Ping {
            heap,
            uptime_ms,
            connections,
            timers,
        } => tracing::debug!(
            target: "arena::events",
            bot,
            heap_used = heap.used_bytes,
            heap_limit = heap.limit_bytes,
            uptime_ms,
            connections,
            timers,
            "ping"
        ),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = arena_config::resolve_path(cli.config.as_deref());
    tracing::info!(path = %config_path.display(), "loading config");
    let config = ArenaConfig::from_file_with_env(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if config.bots.is_empty() {
        tracing::warn!("no bots configured, nothing to run");
        return Ok(());
    }

    let sandbox_config = build_sandbox_config(&config.sandbox);
    let stop_budget = sandbox_config.stop_grace + SHUTDOWN_SLACK;
    let registry = ConfigRegistry::new(&config, &config_path);
    let (manager, mut events) = SandboxManager::new(sandbox_config);

    #[cfg(feature = "metrics")]
    let mut metrics_registry = prometheus_client::registry::Registry::default();
    #[cfg(feature = "metrics")]
    let metrics = arena_sandbox::metrics::SandboxMetrics::new(&mut metrics_registry);

    let mut handles: Vec<SandboxHandle> = Vec::new();
    for bot in &config.bots {
        match manager.spawn_from(&registry, &bot.id).await {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::error!(bot = %bot.id, error = %e, "bot not started"),
        }
    }
    tracing::info!(
        started = handles.len(),
        configured = config.bots.len(),
        "bots launched"
    );

    let mut live = handles.len();
    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let stop_at = deadline.unwrap_or_else(tokio::time::Instant::now);
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
                #[cfg(feature = "metrics")]
                metrics.observe(&event);
                if event.is_terminated() && handles.iter().any(|h| h.bot_id() == event.bot_id) {
                    live = live.saturating_sub(1);
                }
                if live == 0 {
                    break;
                }
            }
            _ = &mut signal, if deadline.is_none() => {
                tracing::info!(live, "shutdown requested, stopping bots");
                for handle in &handles {
                    handle.stop();
                }
                deadline = Some(tokio::time::Instant::now() + stop_budget);
            }
            _ = tokio::time::sleep_until(stop_at), if deadline.is_some() => {
                tracing::warn!(live, "bots did not report termination in time");
                break;
            }
        }
    }

    #[cfg(feature = "metrics")]
    while let Ok(event) = events.try_recv() {
        metrics.observe(&event);
    }

    #[cfg(feature = "metrics")]
    if cli.metrics {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &metrics_registry)
            .context("failed to encode metrics")?;
        print!("{out}");
    }
    #[cfg(not(feature = "metrics"))]
    if cli.metrics {
        tracing::warn!("built without the metrics feature; --metrics ignored");
    }

    drop(handles);
    tracing::info!("arena supervisor exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from(["arena", "--config", "/tmp/a.toml", "--metrics"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/a.toml")));
        assert!(cli.metrics);

        let cli = Cli::try_parse_from(["arena", "-c", "b.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("b.toml")));
        assert!(!cli.metrics);

        let cli = Cli::try_parse_from(["arena"]).unwrap();
        assert_eq!(cli.config, None);
    }

    #[test]
    fn version_flag_short_circuits() {
        let err = Cli::try_parse_from(["arena", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn rejects_unknown_and_incomplete_flags() {
        assert!(Cli::try_parse_from(["arena", "--bogus"]).is_err());
        assert!(Cli::try_parse_from(["arena", "--config"]).is_err());
    }

    #[test]
    fn build_sandbox_config_defaults() {
        let config = build_sandbox_config(&arena_config::SandboxOverrides::default());
        let default = SandboxConfig::default();
        assert_eq!(config.max_heap_size, default.max_heap_size);
        assert_eq!(config.max_connections, default.max_connections);
        assert_eq!(config.callback_timeout, default.callback_timeout);
        assert_eq!(config.execution_mode, default.execution_mode);
    }

    #[test]
    fn build_sandbox_config_applies_overrides() {
        let overrides = arena_config::SandboxOverrides {
            execution_mode: Some("child_process".into()),
            max_heap_mb: Some(8),
            callback_timeout_ms: Some(200),
            max_source_kb: Some(10),
            fatal_rejections: Some(true),
            ..Default::default()
        };
        let config = build_sandbox_config(&overrides);
        assert_eq!(config.execution_mode, ExecutionMode::ChildProcess);
        assert_eq!(config.max_heap_size, 8 * 1024 * 1024);
        assert_eq!(config.callback_timeout, Duration::from_millis(200));
        assert_eq!(config.max_source_size, 10 * 1024);
        assert!(config.fatal_rejections);
    }

    #[tokio::test]
    async fn registry_resolves_scripts_relative_to_config() {
        let config = ArenaConfig::from_toml(
            r#"
            [[bots]]
            id = "alice"
            script = "bots/alice.js"
            endpoint = "ws://127.0.0.1:9000/"
        "#,
        )
        .unwrap();
        let registry = ConfigRegistry::new(&config, Path::new("/srv/arena/arena.toml"));

        let request = registry.lookup("alice").await.unwrap();
        assert_eq!(
            request.source,
            ScriptSource::Path(PathBuf::from("/srv/arena/bots/alice.js"))
        );
        assert_eq!(request.endpoint, "ws://127.0.0.1:9000/");

        let err = registry.lookup("bob").await.unwrap_err();
        assert!(matches!(err, SandboxError::UnknownBot(_)));
    }
}
