//! Isolate supervisor: owns one bot's isolate from creation to teardown.
//!
//! Runs on the bot's dedicated worker thread inside a current-thread tokio
//! runtime. After setup, the isolate executes only when the supervisor calls
//! the prelude's dispatch function for a socket event or a timer fire, one
//! call at a time.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Poll;
use std::time::{Duration, Instant};

use deno_core::v8;
use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::bridge::{self, arena_bridge, BridgeState, PendingRejections};
use crate::error::SandboxError;
use crate::events::{EventKind, EventSink, HeapStats, LifecycleState, TeardownReport};
use crate::manager::SandboxConfig;
use crate::prelude;
use crate::socket::{SocketEvent, SocketProxy};
use crate::timer::TimerScheduler;
use crate::watchdog::{HeapGuard, Watchdog};
use crate::HostEvent;

/// Script name of the bot source in stack traces.
const BOT_SCRIPT_NAME: &str = "[arena:bot]";

/// A bot whose source has been loaded and admitted.
#[derive(Debug, Clone)]
pub(crate) struct LoadedBot {
    pub(crate) bot_id: String,
    pub(crate) source: String,
    pub(crate) endpoint: String,
}

/// Control messages from the sandbox handle.
#[derive(Debug)]
pub(crate) enum Control {
    Stop,
}

/// State shared between the supervisor and its handle.
pub(crate) struct SupervisorShared {
    stop_requested: AtomicBool,
    isolate: OnceLock<v8::IsolateHandle>,
    state: watch::Sender<LifecycleState>,
}

impl SupervisorShared {
    pub(crate) fn new(state: watch::Sender<LifecycleState>) -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            isolate: OnceLock::new(),
            state,
        }
    }

    /// Request a stop. Interrupts guest code that is currently running.
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.isolate.get() {
                handle.terminate_execution();
            }
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn transition(
        &self,
        sink: &EventSink,
        state: LifecycleState,
        teardown: Option<TeardownReport>,
    ) {
        self.state.send_replace(state);
        tracing::debug!(bot = %sink.bot_id(), state = ?state, "lifecycle transition");
        sink.status(state, teardown);
    }

    fn publish_isolate(&self, handle: v8::IsolateHandle) {
        let handle = self.isolate.get_or_init(|| handle);
        // A stop that raced isolate construction still interrupts setup.
        if self.stop_requested() {
            handle.terminate_execution();
        }
    }
}

/// Why the serve loop ended.
#[derive(Debug)]
enum Termination {
    Stopped,
    Fatal(String),
    HeapLimit,
}

/// One typed re-entry into the guest.
#[derive(Debug)]
enum GuestCall {
    Timer(u32),
    Open(i32),
    Message(i32, String),
    Error(i32, String),
    Close { handle: i32, code: u16, reason: String },
}

impl GuestCall {
    fn socket(handle: i32, event: SocketEvent) -> Self {
        match event {
            SocketEvent::Open => Self::Open(handle),
            SocketEvent::Message(text) => Self::Message(handle, text),
            SocketEvent::Error(message) => Self::Error(handle, message),
            SocketEvent::Close { code, reason } => Self::Close {
                handle,
                code,
                reason,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Timer(_) => "timer",
            Self::Open(_) => "open",
            Self::Message(..) => "message",
            Self::Error(..) => "error",
            Self::Close { .. } => "close",
        }
    }

    fn id(&self) -> f64 {
        match self {
            Self::Timer(id) => f64::from(*id),
            Self::Open(handle)
            | Self::Message(handle, _)
            | Self::Error(handle, _)
            | Self::Close { handle, .. } => f64::from(*handle),
        }
    }

    /// Arguments for `dispatch(kind, id, data, code)`. Only primitives cross.
    fn to_args<'s>(&self, scope: &mut v8::HandleScope<'s>) -> Vec<v8::Local<'s, v8::Value>> {
        let kind = js_string(scope, self.kind());
        let id: v8::Local<v8::Value> = v8::Number::new(scope, self.id()).into();
        match self {
            Self::Timer(_) | Self::Open(_) => vec![kind, id],
            Self::Message(_, text) | Self::Error(_, text) => {
                let data = js_string(scope, text);
                vec![kind, id, data]
            }
            Self::Close { code, reason, .. } => {
                let data = js_string(scope, reason);
                let code: v8::Local<v8::Value> = v8::Integer::new(scope, i32::from(*code)).into();
                vec![kind, id, data, code]
            }
        }
    }
}

fn js_string<'s>(scope: &mut v8::HandleScope<'s>, text: &str) -> v8::Local<'s, v8::Value> {
    match v8::String::new(scope, text) {
        Some(s) => s.into(),
        None => v8::undefined(scope).into(),
    }
}

enum Invoke {
    Returned,
    Threw(String),
    Terminated,
}

enum Reentry {
    Completed,
    Rejected(String),
    Threw(String),
    TimedOut,
    Terminated,
    HeapLimit,
}

/// Poll the runtime's event loop once so microtasks and promise rejections
/// settle. Returns the loop error, if any.
async fn settle_once(runtime: &mut JsRuntime) -> Option<String> {
    poll_fn(|cx| match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
        Poll::Ready(Err(e)) => Poll::Ready(Some(e.to_string())),
        Poll::Ready(Ok(())) | Poll::Pending => Poll::Ready(None),
    })
    .await
}

/// The V8 runtime plus its heap-limit callback state. Fields drop in
/// order, so the runtime is gone before the callback state is freed.
struct Engine {
    runtime: JsRuntime,
    heap_guard: HeapGuard,
}

/// A live bot isolate. The dispatch handle and the watchdog drop before the
/// engine.
struct Isolate {
    config: SandboxConfig,
    sink: EventSink,
    started: Instant,
    dispatch: v8::Global<v8::Function>,
    watchdog: Watchdog,
    engine: Engine,
}

impl Isolate {
    async fn create(
        bot: &LoadedBot,
        config: &SandboxConfig,
        sink: &EventSink,
        host_events: mpsc::UnboundedSender<HostEvent>,
        shared: &SupervisorShared,
    ) -> Result<Self, SandboxError> {
        let started = Instant::now();
        let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
        let mut runtime = JsRuntime::try_new(RuntimeOptions {
            extensions: vec![arena_bridge::init_ops_and_esm()],
            create_params: Some(create_params),
            ..Default::default()
        })
        .map_err(|e| SandboxError::IsolateConstruction {
            message: e.to_string(),
        })?;

        let heap_guard = HeapGuard::install(runtime.v8_isolate());
        let mut engine = Engine {
            runtime,
            heap_guard,
        };
        let handle = engine.runtime.v8_isolate().thread_safe_handle();
        let watchdog = Watchdog::spawn(handle.clone(), &bot.bot_id).map_err(|e| {
            SandboxError::IsolateConstruction {
                message: format!("failed to start watchdog: {e}"),
            }
        })?;
        shared.publish_isolate(handle);

        {
            let op_state = engine.runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(SocketProxy::new(
                config.max_connections,
                config.max_send_size,
                host_events.clone(),
            ));
            op_state.put(TimerScheduler::new(config.max_timers, host_events));
            op_state.put(BridgeState {
                sink: sink.clone(),
                identity_json: bridge::identity_json(&bot.bot_id, &bot.endpoint),
                max_log_size: config.max_log_size,
            });
            op_state.put(PendingRejections::default());
        }

        watchdog.arm(config.setup_timeout);
        let setup = Self::run_setup(&mut engine.runtime, &bot.source).await;
        let timed_out = watchdog.disarm();

        if engine.heap_guard.triggered() {
            return Err(SandboxError::HeapLimitExceeded);
        }
        if timed_out {
            return Err(SandboxError::SetupTimeout {
                timeout_ms: config.setup_timeout.as_millis() as u64,
            });
        }
        let (dispatch, loop_error) = setup?;

        let mut isolate = Self {
            config: config.clone(),
            sink: sink.clone(),
            started,
            dispatch,
            watchdog,
            engine,
        };
        if let Some(message) = loop_error {
            isolate.push_rejection(message);
        }
        match isolate.drain_rejections() {
            Some(Termination::Fatal(message)) => Err(SandboxError::SetupFailed { message }),
            _ => Ok(isolate),
        }
    }

    async fn run_setup(
        runtime: &mut JsRuntime,
        source: &str,
    ) -> Result<(v8::Global<v8::Function>, Option<String>), SandboxError> {
        let dispatch = prelude::install(runtime)?;
        runtime
            .execute_script(BOT_SCRIPT_NAME, source.to_string())
            .map_err(|e| SandboxError::SetupFailed {
                message: e.to_string(),
            })?;
        let loop_error = settle_once(runtime).await;
        Ok((dispatch, loop_error))
    }

    async fn serve(
        &mut self,
        host_events: &mut mpsc::UnboundedReceiver<HostEvent>,
        control: &mut mpsc::UnboundedReceiver<Control>,
        shared: &SupervisorShared,
    ) -> Termination {
        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut breaches = 0u32;

        loop {
            if shared.stop_requested() {
                return Termination::Stopped;
            }
            tokio::select! {
                biased;
                // Stop, or the handle was dropped.
                _ = control.recv() => return Termination::Stopped,
                Some(event) = host_events.recv() => {
                    if let Some(termination) = self.deliver(event, shared).await {
                        return termination;
                    }
                }
                _ = ping.tick() => {
                    if let Some(termination) = self.probe(&mut breaches) {
                        return termination;
                    }
                }
            }
        }
    }

    async fn deliver(&mut self, event: HostEvent, shared: &SupervisorShared) -> Option<Termination> {
        let call = self.accept(event)?;
        let outcome = self.reenter(&call).await;
        self.resolve(&call, outcome, shared)
    }

    /// Update host-side tables for an event and decide whether the guest
    /// should see it. Events for released handles and cancelled timers are
    /// dropped here.
    fn accept(&mut self, event: HostEvent) -> Option<GuestCall> {
        let op_state = self.engine.runtime.op_state();
        let mut op_state = op_state.borrow_mut();
        match event {
            HostEvent::Timer { id } => op_state
                .borrow_mut::<TimerScheduler>()
                .take_fire(id)
                .then_some(GuestCall::Timer(id)),
            HostEvent::Socket { handle, event } => {
                let proxy = op_state.borrow_mut::<SocketProxy>();
                let live = match &event {
                    SocketEvent::Open => proxy.mark_open(handle),
                    SocketEvent::Close { .. } => proxy.release(handle),
                    SocketEvent::Message(_) | SocketEvent::Error(_) => proxy.contains(handle),
                };
                live.then(|| GuestCall::socket(handle, event))
            }
        }
    }

    async fn reenter(&mut self, call: &GuestCall) -> Reentry {
        self.watchdog.arm(self.config.callback_timeout);
        let invoked = self.invoke(call);
        let loop_error = match invoked {
            Invoke::Returned => settle_once(&mut self.engine.runtime).await,
            Invoke::Threw(_) | Invoke::Terminated => None,
        };
        let timed_out = self.watchdog.disarm();

        if self.engine.heap_guard.triggered() {
            return Reentry::HeapLimit;
        }
        if timed_out {
            return Reentry::TimedOut;
        }
        match invoked {
            Invoke::Returned => match loop_error {
                None => Reentry::Completed,
                Some(message) => Reentry::Rejected(message),
            },
            Invoke::Threw(message) => Reentry::Threw(message),
            Invoke::Terminated => Reentry::Terminated,
        }
    }

    fn invoke(&mut self, call: &GuestCall) -> Invoke {
        let scope = &mut self.engine.runtime.handle_scope();
        let dispatch = v8::Local::new(scope, &self.dispatch);
        let recv: v8::Local<v8::Value> = v8::undefined(scope).into();
        let args = call.to_args(scope);

        let tc = &mut v8::TryCatch::new(scope);
        let result = dispatch.call(tc, recv, &args);
        if tc.has_terminated() {
            return Invoke::Terminated;
        }
        match tc.exception() {
            Some(exception) => {
                let message = exception.to_rust_string_lossy(tc);
                if message.is_empty() {
                    Invoke::Threw("uncaught exception".into())
                } else {
                    Invoke::Threw(message)
                }
            }
            None if result.is_none() => Invoke::Terminated,
            None => Invoke::Returned,
        }
    }

    fn resolve(
        &mut self,
        call: &GuestCall,
        outcome: Reentry,
        shared: &SupervisorShared,
    ) -> Option<Termination> {
        match outcome {
            Reentry::HeapLimit => Some(Termination::HeapLimit),
            _ if shared.stop_requested() => Some(Termination::Stopped),
            Reentry::Completed => self.drain_rejections(),
            Reentry::Rejected(message) => {
                self.push_rejection(message);
                self.drain_rejections()
            }
            Reentry::TimedOut => {
                let budget = self.config.callback_timeout.as_millis();
                tracing::warn!(
                    bot = %self.sink.bot_id(),
                    kind = call.kind(),
                    budget_ms = budget as u64,
                    "guest handler interrupted"
                );
                self.sink.error(
                    format!("{} handler exceeded {budget}ms and was interrupted", call.kind()),
                    false,
                );
                self.drain_rejections()
            }
            Reentry::Threw(message) => Some(Termination::Fatal(format!(
                "uncaught exception in {} handler: {message}",
                call.kind()
            ))),
            Reentry::Terminated => {
                Some(Termination::Fatal("guest execution was terminated".into()))
            }
        }
    }

    fn push_rejection(&mut self, message: String) {
        let op_state = self.engine.runtime.op_state();
        op_state
            .borrow_mut()
            .borrow_mut::<PendingRejections>()
            .0
            .push(message);
    }

    /// Report rejections collected since the last drain.
    fn drain_rejections(&mut self) -> Option<Termination> {
        let pending = {
            let op_state = self.engine.runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            std::mem::take(&mut op_state.borrow_mut::<PendingRejections>().0)
        };
        for reason in pending {
            let message = format!("unhandled promise rejection: {reason}");
            if self.config.fatal_rejections {
                return Some(Termination::Fatal(message));
            }
            tracing::warn!(bot = %self.sink.bot_id(), %message, "recoverable guest error");
            self.sink.error(message, false);
        }
        None
    }

    fn resource_counts(&mut self) -> (usize, usize) {
        let op_state = self.engine.runtime.op_state();
        let op_state = op_state.borrow();
        (
            op_state.borrow::<SocketProxy>().len(),
            op_state.borrow::<TimerScheduler>().len(),
        )
    }

    /// Liveness probe. Emits a ping and tracks sustained heap pressure.
    fn probe(&mut self, breaches: &mut u32) -> Option<Termination> {
        let stats = self.engine.runtime.v8_isolate().get_heap_statistics();
        let heap = HeapStats {
            used_bytes: stats.used_heap_size(),
            total_bytes: stats.total_heap_size(),
            limit_bytes: self.config.max_heap_size,
        };
        let (connections, timers) = self.resource_counts();
        self.sink.emit(EventKind::Ping {
            heap,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            connections,
            timers,
        });

        if heap.usage_ratio() >= self.config.heap_breach_ratio {
            *breaches += 1;
            tracing::warn!(
                bot = %self.sink.bot_id(),
                used = heap.used_bytes,
                limit = heap.limit_bytes,
                consecutive = *breaches,
                "heap near ceiling"
            );
        } else {
            *breaches = 0;
        }
        (*breaches >= self.config.heap_breach_probes.max(1)).then_some(Termination::HeapLimit)
    }

    /// Close every connection and clear every timer.
    fn teardown(self) -> TeardownReport {
        let op_state = self.engine.runtime.op_state();
        let mut op_state = op_state.borrow_mut();

        let proxy = op_state.borrow_mut::<SocketProxy>();
        let connections_closed = proxy.shutdown();
        let connections_remaining = proxy.len();

        let timers = op_state.borrow_mut::<TimerScheduler>();
        let timers_cleared = timers.shutdown();
        let timers_remaining = timers.len();

        TeardownReport {
            connections_closed,
            timers_cleared,
            connections_remaining,
            timers_remaining,
        }
    }
}

/// Drive one bot through its whole lifecycle.
pub(crate) async fn run_sandbox(
    bot: LoadedBot,
    config: SandboxConfig,
    sink: EventSink,
    shared: Arc<SupervisorShared>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    shared.transition(&sink, LifecycleState::Created, None);

    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    let mut isolate = match Isolate::create(&bot, &config, &sink, host_tx, &shared).await {
        Ok(isolate) => isolate,
        Err(e) => {
            if shared.stop_requested() {
                tracing::info!(bot = %bot.bot_id, "stopped during setup");
            } else {
                tracing::warn!(bot = %bot.bot_id, error = %e, "bot setup failed");
                sink.error(e.to_string(), true);
            }
            shared.transition(&sink, LifecycleState::Terminated, None);
            return;
        }
    };

    shared.transition(&sink, LifecycleState::Running, None);
    tracing::info!(bot = %bot.bot_id, "bot running");

    let termination = isolate.serve(&mut host_rx, &mut control, &shared).await;

    shared.transition(&sink, LifecycleState::Terminating, None);
    match &termination {
        Termination::Stopped => tracing::info!(bot = %bot.bot_id, "bot stopped"),
        Termination::Fatal(message) => {
            tracing::warn!(bot = %bot.bot_id, error = %message, "bot failed");
            sink.error(message.clone(), true);
        }
        Termination::HeapLimit => {
            let message = SandboxError::HeapLimitExceeded.to_string();
            tracing::warn!(bot = %bot.bot_id, error = %message, "bot failed");
            sink.error(message, true);
        }
    }

    let report = isolate.teardown();
    tracing::info!(
        bot = %bot.bot_id,
        connections_closed = report.connections_closed,
        timers_cleared = report.timers_cleared,
        "bot terminated"
    );
    shared.transition(&sink, LifecycleState::Terminated, Some(report));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_call_kinds_match_dispatch_names() {
        assert_eq!(GuestCall::Timer(1).kind(), "timer");
        assert_eq!(GuestCall::socket(2, SocketEvent::Open).kind(), "open");
        assert_eq!(
            GuestCall::socket(2, SocketEvent::Message("hi".into())).kind(),
            "message"
        );
        assert_eq!(
            GuestCall::socket(2, SocketEvent::Error("boom".into())).kind(),
            "error"
        );
        let close = GuestCall::socket(
            3,
            SocketEvent::Close {
                code: 1000,
                reason: String::new(),
            },
        );
        assert_eq!(close.kind(), "close");
        assert_eq!(close.id(), 3.0);
    }

    #[test]
    fn stop_before_isolate_is_recorded() {
        let (tx, _rx) = watch::channel(LifecycleState::Created);
        let shared = SupervisorShared::new(tx);
        assert!(!shared.stop_requested());
        shared.request_stop();
        shared.request_stop();
        assert!(shared.stop_requested());
        assert_eq!(shared.state(), LifecycleState::Created);
    }
}
