//! Parent side of child-process sandboxes.
//!
//! Spawns `arena-sandbox-worker` with a clean environment, ships it one
//! admitted bot over IPC, and relays the worker's event stream into the
//! manager's channel. If the worker dies without reporting a terminal status,
//! the parent reports it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};

use crate::error::SandboxError;
use crate::events::{EventKind, EventSink, LifecycleState};
use crate::ipc::{read_message, write_message, ChildMessage, ParentMessage, WorkerConfig};
use crate::manager::{SandboxConfig, SandboxHandle};
use crate::supervisor::{Control, LoadedBot};
use crate::{BotRequest, ScriptSource};

/// Worker binary name.
pub const WORKER_BINARY: &str = "arena-sandbox-worker";

/// Env var naming an absolute path to the worker binary.
pub const WORKER_BIN_ENV: &str = "ARENA_WORKER_BIN";

/// Env var that lets worker stderr through to the parent's stderr.
pub const DEBUG_ENV: &str = "ARENA_DEBUG";

pub(crate) async fn spawn_child(
    bot: LoadedBot,
    config: &SandboxConfig,
    sink: EventSink,
    permit: OwnedSemaphorePermit,
) -> Result<SandboxHandle, SandboxError> {
    let started = launch(&bot, config).await;
    let (child, stdin, stdout) = match started {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(bot = %bot.bot_id, error = %e, "failed to start sandbox worker");
            sink.error(e.to_string(), true);
            sink.status(LifecycleState::Terminated, None);
            return Err(e);
        }
    };

    let (state_tx, state_rx) = watch::channel(LifecycleState::Created);
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    // Frames are read on their own task so a partial read is never lost to
    // a competing select branch.
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let max_frame = config.max_ipc_message_size;
    tokio::spawn(async move {
        let mut stdout = BufReader::new(stdout);
        loop {
            let frame = read_message::<ChildMessage, _>(&mut stdout, max_frame).await;
            let done = !matches!(frame, Ok(Some(_)));
            if frames_tx.send(frame).is_err() || done {
                break;
            }
        }
    });

    tokio::spawn(relay(
        Relay {
            child,
            stdin,
            sink,
            state: state_tx,
            stop_grace: config.stop_grace,
            _permit: permit,
        },
        frames_rx,
        control_rx,
    ));

    Ok(SandboxHandle::new(bot.bot_id, control_tx, None, state_rx))
}

async fn launch(
    bot: &LoadedBot,
    config: &SandboxConfig,
) -> Result<(Child, ChildStdin, tokio::process::ChildStdout), SandboxError> {
    let worker_bin = find_worker_binary()?;
    let mut child = Command::new(&worker_bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if std::env::var(DEBUG_ENV).is_ok() {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .env_clear()
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "failed to spawn worker at {}: {}",
                worker_bin.display(),
                e
            ))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on worker")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on worker")))?;

    let start = ParentMessage::Start {
        request: BotRequest {
            bot_id: bot.bot_id.clone(),
            source: ScriptSource::Inline(bot.source.clone()),
            endpoint: bot.endpoint.clone(),
        },
        config: WorkerConfig::from(config),
    };
    write_message(&mut stdin, &start)
        .await
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("failed to send Start: {e}")))?;

    tracing::debug!(bot = %bot.bot_id, worker = %worker_bin.display(), "sandbox worker started");
    Ok((child, stdin, stdout))
}

struct Relay {
    child: Child,
    stdin: ChildStdin,
    sink: EventSink,
    state: watch::Sender<LifecycleState>,
    stop_grace: Duration,
    _permit: OwnedSemaphorePermit,
}

type Frame = std::io::Result<Option<ChildMessage>>;

async fn relay(
    mut relay: Relay,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let bot_id = relay.sink.bot_id().to_string();
    let mut stop_deadline: Option<tokio::time::Instant> = None;
    let mut terminated = false;

    loop {
        let deadline = stop_deadline.unwrap_or_else(tokio::time::Instant::now);
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Ok(Some(ChildMessage::Event { event }))) => {
                    if let EventKind::Status { state, .. } = &event.kind {
                        relay.state.send_replace(*state);
                    }
                    terminated = event.is_terminated();
                    relay.sink.forward(event);
                    if terminated {
                        break;
                    }
                }
                Some(Ok(None)) | None => {
                    tracing::debug!(bot = %bot_id, "worker closed its output");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(bot = %bot_id, error = %e, "worker IPC read failed");
                    break;
                }
            },
            _ = control.recv(), if stop_deadline.is_none() => {
                if let Err(e) = write_message(&mut relay.stdin, &ParentMessage::Stop).await {
                    tracing::debug!(bot = %bot_id, error = %e, "could not deliver Stop to worker");
                }
                stop_deadline = Some(tokio::time::Instant::now() + relay.stop_grace);
            }
            _ = tokio::time::sleep_until(deadline), if stop_deadline.is_some() => {
                tracing::warn!(bot = %bot_id, "worker did not stop in time; killing it");
                break;
            }
        }
    }

    // The worker exits on its own after the terminal status; give it the
    // grace period before forcing it.
    if tokio::time::timeout(relay.stop_grace, relay.child.wait())
        .await
        .is_err()
    {
        let _ = relay.child.kill().await;
    }

    if !terminated {
        let message = if stop_deadline.is_some() {
            "sandbox worker was killed after a stop request"
        } else {
            "sandbox worker exited unexpectedly"
        };
        tracing::warn!(bot = %bot_id, "{message}");
        relay.sink.error(message, true);
        relay.state.send_replace(LifecycleState::Terminated);
        relay.sink.status(LifecycleState::Terminated, None);
    }
}

/// Find the `arena-sandbox-worker` binary.
///
/// Search order:
/// 1. `ARENA_WORKER_BIN` (must be an absolute path)
/// 2. The current executable's directory, then its parent (test binaries
///    live in `target/<profile>/deps/`)
///
/// On Unix, world-writable binaries are rejected.
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        let dirs = exe.parent().into_iter().flat_map(|dir| [Some(dir), dir.parent()]);
        for dir in dirs.flatten() {
            let worker = dir.join(WORKER_BINARY);
            if worker.exists() {
                validate_binary_permissions(&worker)?;
                return Ok(worker);
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BINARY} binary not found. Set {WORKER_BIN_ENV} or install it next to arena"
    )))
}

fn validate_binary_permissions(path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                path.display(),
                mode,
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
