//! Sandbox manager: admits bots and gives each one its own worker.
//!
//! The manager is `Send + Sync`. All V8 work happens on the per-bot worker
//! (a dedicated OS thread or a child process); a semaphore bounds how many
//! workers exist at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};

use crate::error::SandboxError;
use crate::events::{EventSink, LifecycleState, SandboxEvent};
use crate::scanner;
use crate::supervisor::{self, Control, LoadedBot, SupervisorShared};
use crate::watchdog::thread_name_safe;
use crate::{BotRegistry, BotRequest};

/// Where each bot's isolate runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// A dedicated OS thread in this process (default, suitable for tests).
    #[default]
    InProcess,
    /// A dedicated `arena-sandbox-worker` child process per bot.
    ChildProcess,
}

/// Limits and timing for every sandbox the manager creates.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// In-process threads or child processes.
    pub execution_mode: ExecutionMode,
    /// Maximum concurrently live sandboxes.
    pub max_workers: usize,
    /// Maximum bot source size in bytes.
    pub max_source_size: usize,
    /// V8 heap ceiling per isolate in bytes.
    pub max_heap_size: usize,
    /// Maximum simultaneous socket connections per bot.
    pub max_connections: usize,
    /// Maximum pending timers per bot.
    pub max_timers: usize,
    /// Budget for running the bot's top-level source.
    pub setup_timeout: Duration,
    /// Budget for each re-entry into the guest.
    pub callback_timeout: Duration,
    /// Outbound socket text cap in bytes.
    pub max_send_size: usize,
    /// Guest log text cap in bytes.
    pub max_log_size: usize,
    /// Period of the liveness probe.
    pub ping_interval: Duration,
    /// Heap usage ratio that counts as a breach.
    pub heap_breach_ratio: f64,
    /// Consecutive breaching probes before the sandbox is terminated.
    pub heap_breach_probes: u32,
    /// Treat unhandled promise rejections as fatal.
    pub fatal_rejections: bool,
    /// How long a child worker gets to exit after a stop request.
    pub stop_grace: Duration,
    /// Maximum IPC frame size for child workers.
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            max_workers: 64,
            max_source_size: scanner::DEFAULT_MAX_SOURCE_SIZE,
            max_heap_size: 16 * 1024 * 1024, // 16 MB
            max_connections: 3,
            max_timers: 100,
            setup_timeout: Duration::from_secs(30),
            callback_timeout: Duration::from_secs(5),
            max_send_size: 4096,
            max_log_size: 500,
            ping_interval: Duration::from_secs(10),
            heap_breach_ratio: 0.9,
            heap_breach_probes: 3,
            fatal_rejections: false,
            stop_grace: Duration::from_secs(2),
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

/// Handle to one running sandbox.
///
/// Dropping the handle stops the sandbox.
pub struct SandboxHandle {
    bot_id: String,
    control: mpsc::UnboundedSender<Control>,
    interrupt: Option<Arc<SupervisorShared>>,
    state: watch::Receiver<LifecycleState>,
}

impl SandboxHandle {
    pub(crate) fn new(
        bot_id: String,
        control: mpsc::UnboundedSender<Control>,
        interrupt: Option<Arc<SupervisorShared>>,
        state: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            bot_id,
            control,
            interrupt,
            state,
        }
    }

    /// The bot this handle controls.
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Ask the sandbox to terminate. Interrupts running guest code.
    /// Calling this more than once, or after termination, is a no-op.
    pub fn stop(&self) {
        if let Some(shared) = &self.interrupt {
            shared.request_stop();
        }
        let _ = self.control.send(Control::Stop);
    }

    /// Wait until the sandbox reaches [`LifecycleState::Terminated`].
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        // The sender goes away only after the terminal state was published.
        let _ = state
            .wait_for(|s| *s == LifecycleState::Terminated)
            .await;
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("bot_id", &self.bot_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Admits bots and runs each one in its own worker.
pub struct SandboxManager {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    events: mpsc::UnboundedSender<SandboxEvent>,
}

impl SandboxManager {
    /// Create a manager and the receiving end of its event stream.
    pub fn new(config: SandboxConfig) -> (Self, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_events(config, tx), rx)
    }

    /// Create a manager that reports into an existing event channel.
    pub fn with_events(config: SandboxConfig, events: mpsc::UnboundedSender<SandboxEvent>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        Self {
            config,
            semaphore,
            events,
        }
    }

    /// The configuration every sandbox gets.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Number of workers currently allocated.
    pub fn active_workers(&self) -> usize {
        self.config
            .max_workers
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Start a bot.
    ///
    /// The source is loaded and scanned before a worker is allocated. A
    /// rejected bot produces exactly one error event and a terminal status,
    /// and never consumes a worker.
    pub async fn spawn(&self, request: BotRequest) -> Result<SandboxHandle, SandboxError> {
        let sink = EventSink::new(&request.bot_id, self.events.clone());
        tracing::info!(
            bot = %request.bot_id,
            mode = ?self.config.execution_mode,
            "spawn: admitting bot"
        );

        let (source, permit) = match self.admit(&request).await {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::warn!(bot = %request.bot_id, error = %e, "spawn: rejected");
                sink.error(e.to_string(), true);
                sink.status(LifecycleState::Terminated, None);
                return Err(e);
            }
        };

        let bot = LoadedBot {
            bot_id: request.bot_id,
            source,
            endpoint: request.endpoint,
        };
        match self.config.execution_mode {
            ExecutionMode::InProcess => spawn_in_process(bot, self.config.clone(), sink, permit),
            ExecutionMode::ChildProcess => {
                crate::host::spawn_child(bot, &self.config, sink, permit).await
            }
        }
    }

    /// Resolve a bot through `registry` and start it.
    pub async fn spawn_from(
        &self,
        registry: &dyn BotRegistry,
        bot_id: &str,
    ) -> Result<SandboxHandle, SandboxError> {
        match registry.lookup(bot_id).await {
            Ok(request) => self.spawn(request).await,
            Err(e) => {
                tracing::warn!(bot = %bot_id, error = %e, "spawn: lookup failed");
                let sink = EventSink::new(bot_id, self.events.clone());
                sink.error(e.to_string(), true);
                sink.status(LifecycleState::Terminated, None);
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        request: &BotRequest,
    ) -> Result<(String, OwnedSemaphorePermit), SandboxError> {
        let source = request.source.load().await?;
        scanner::admit(&source, Some(self.config.max_source_size))?;
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| SandboxError::WorkerLimit {
                max: self.config.max_workers,
            })?;
        Ok((source, permit))
    }
}

/// Makes sure the event stream ends with a terminal status even if the
/// worker thread unwinds.
struct ExitGuard {
    sink: EventSink,
    shared: Arc<SupervisorShared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.shared.state() != LifecycleState::Terminated {
            tracing::error!(bot = %self.sink.bot_id(), "sandbox worker exited unexpectedly");
            self.sink.error("sandbox worker exited unexpectedly", true);
            self.shared
                .transition(&self.sink, LifecycleState::Terminated, None);
        }
    }
}

fn spawn_in_process(
    bot: LoadedBot,
    config: SandboxConfig,
    sink: EventSink,
    permit: OwnedSemaphorePermit,
) -> Result<SandboxHandle, SandboxError> {
    let (state_tx, state_rx) = watch::channel(LifecycleState::Created);
    let shared = Arc::new(SupervisorShared::new(state_tx));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let bot_id = bot.bot_id.clone();

    let thread_shared = shared.clone();
    let thread_sink = sink.clone();
    std::thread::Builder::new()
        .name(format!("arena-bot-{}", thread_name_safe(&bot_id)))
        .spawn(move || {
            // Released last, after the runtime and the isolate are gone.
            let _permit = permit;
            let _guard = ExitGuard {
                sink: thread_sink.clone(),
                shared: thread_shared.clone(),
            };
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    thread_sink.error(format!("failed to start worker runtime: {e}"), true);
                    thread_shared.transition(&thread_sink, LifecycleState::Terminated, None);
                    return;
                }
            };
            rt.block_on(supervisor::run_sandbox(
                bot,
                config,
                thread_sink,
                thread_shared,
                control_rx,
            ));
        })
        .map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!("failed to spawn sandbox thread: {e}"))
        })?;

    Ok(SandboxHandle::new(
        bot_id,
        control_tx,
        Some(shared),
        state_rx,
    ))
}
