//! Shared fixtures for sandbox integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_sandbox::events::GuestLogLevel;
use arena_sandbox::{BotRequest, EventKind, LifecycleState, SandboxEvent, ScriptSource};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// How long a test waits for any single expected event.
pub const EVENT_WAIT: Duration = Duration::from_secs(10);

/// Loopback WebSocket server that echoes text frames and counts
/// connections.
pub struct EchoServer {
    pub url: String,
    pub accepted: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let (acc, clo) = (accepted.clone(), closed.clone());
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (acc, clo) = (acc.clone(), clo.clone());
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    acc.fetch_add(1, Ordering::SeqCst);
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Text(text) => {
                                if ws.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    clo.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            url,
            accepted,
            closed,
            task,
        }
    }

    /// Wait until `n` connections have ended on the server side.
    pub async fn wait_closed(&self, n: usize) {
        let closed = self.closed.clone();
        tokio::time::timeout(EVENT_WAIT, async move {
            while closed.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server connections did not close");
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn request(bot_id: &str, source: &str, endpoint: &str) -> BotRequest {
    BotRequest {
        bot_id: bot_id.into(),
        source: ScriptSource::Inline(source.into()),
        endpoint: endpoint.into(),
    }
}

/// Endpoint for bots that never connect.
pub const NO_ENDPOINT: &str = "ws://127.0.0.1:9/";

pub async fn next_event(events: &mut UnboundedReceiver<SandboxEvent>) -> SandboxEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for a sandbox event")
        .expect("event stream closed")
}

/// Read events for `bot` until one matches, returning everything read.
pub async fn events_until<F>(
    events: &mut UnboundedReceiver<SandboxEvent>,
    bot: &str,
    mut done: F,
) -> Vec<SandboxEvent>
where
    F: FnMut(&SandboxEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        if event.bot_id != bot {
            continue;
        }
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

pub async fn until_state(
    events: &mut UnboundedReceiver<SandboxEvent>,
    bot: &str,
    state: LifecycleState,
) -> Vec<SandboxEvent> {
    events_until(events, bot, |e| {
        matches!(&e.kind, EventKind::Status { state: s, .. } if *s == state)
    })
    .await
}

pub async fn until_terminated(
    events: &mut UnboundedReceiver<SandboxEvent>,
    bot: &str,
) -> Vec<SandboxEvent> {
    events_until(events, bot, SandboxEvent::is_terminated).await
}

pub async fn until_log(
    events: &mut UnboundedReceiver<SandboxEvent>,
    bot: &str,
    text: &str,
) -> Vec<SandboxEvent> {
    events_until(
        events,
        bot,
        |e| matches!(&e.kind, EventKind::Log { text: t, .. } if t == text),
    )
    .await
}

pub fn logs(events: &[SandboxEvent]) -> Vec<(GuestLogLevel, String)> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Log { level, text } => Some((*level, text.clone())),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[SandboxEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Error { message, fatal } => Some((message.clone(), *fatal)),
            _ => None,
        })
        .collect()
}

pub fn states(events: &[SandboxEvent]) -> Vec<LifecycleState> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Status { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}
