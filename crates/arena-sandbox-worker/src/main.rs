//! Arena sandbox worker: isolated child process hosting one bot.
//!
//! Spawned by the parent's sandbox manager in child-process mode. Reads a
//! single `Start` frame from stdin, runs the bot in an in-process sandbox,
//! and streams every event back over stdout until the bot terminates. A
//! `Stop` frame, EOF on stdin, or a termination signal stops the bot.
//!
//! **Security**: the process runs with a clean environment and no inherited
//! credentials; the bot's only reachable surface is the sandbox bridge.

use anyhow::{Context, Result};
use arena_sandbox::ipc::{read_message, write_message, ChildMessage, ParentMessage};
use arena_sandbox::SandboxManager;
use tokio::io::{self, BufReader};
use tokio::sync::mpsc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // The parent already cleared the environment; drop anything left.
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let first: ParentMessage = read_message(
        &mut stdin,
        arena_sandbox::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
    )
    .await
    .context("failed to read initial message from parent")?
    .context("parent closed stdin before sending Start")?;

    let (request, config) = match first {
        ParentMessage::Start { request, config } => (request, config),
        ParentMessage::Stop => return Ok(()),
    };
    let max_frame = config.max_ipc_message_size;

    let (manager, mut events) = SandboxManager::new(config.to_sandbox_config());
    // On rejection the event stream already carries the error and the
    // terminal status, so the loop below forwards them and exits.
    let handle = manager.spawn(request).await.ok();

    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        loop {
            match read_message::<ParentMessage, _>(&mut stdin, max_frame).await {
                Ok(Some(ParentMessage::Stop)) => {}
                Ok(Some(ParentMessage::Start { .. })) => {
                    tracing::warn!("ignoring second Start from parent");
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "failed to read from parent"),
            }
            let _ = control_tx.send(());
            break;
        }
    });

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut stopping = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let done = event.is_terminated();
                write_message(&mut stdout, &ChildMessage::Event { event })
                    .await
                    .context("failed to write event to parent")?;
                if done {
                    break;
                }
            }
            _ = control_rx.recv(), if !stopping => {
                stopping = true;
                if let Some(handle) = &handle {
                    handle.stop();
                }
            }
            _ = &mut signal, if !stopping => {
                stopping = true;
                if let Some(handle) = &handle {
                    handle.stop();
                }
            }
        }
    }

    if let Some(handle) = handle {
        handle.terminated().await;
    }
    Ok(())
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
