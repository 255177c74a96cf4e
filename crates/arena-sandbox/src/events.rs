//! Outbound event stream of a sandbox.
//!
//! These records are the only observable output of a sandbox besides the
//! socket traffic it proxies. They are serializable so the child-process
//! worker can forward them verbatim over IPC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Lifecycle of one isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Isolate requested but not yet live.
    Created,
    /// Setup finished; the isolate only runs on re-entry.
    Running,
    /// Teardown in progress.
    Terminating,
    /// All resources released.
    Terminated,
}

/// Severity tag passed by the guest's console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestLogLevel {
    /// `console.debug`
    Debug,
    /// `console.log` / `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl GuestLogLevel {
    /// Parse the level tag sent by the prelude. Unknown tags log at info.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Heap statistics reported by the liveness probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeapStats {
    /// Bytes currently used by the JS heap.
    pub used_bytes: usize,
    /// Total heap size reserved by V8.
    pub total_bytes: usize,
    /// Configured heap ceiling.
    pub limit_bytes: usize,
}

impl HeapStats {
    /// Fraction of the ceiling in use, in `0.0..=1.0` (or above when V8 has
    /// granted grace).
    pub fn usage_ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

/// What teardown released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Connections that were still live and got closed.
    pub connections_closed: usize,
    /// Timers that were still pending and got cleared.
    pub timers_cleared: usize,
    /// Connections left in the table afterwards (always zero).
    pub connections_remaining: usize,
    /// Timers left in the table afterwards (always zero).
    pub timers_remaining: usize,
}

/// Payload of a [`SandboxEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A guest `console.*` call.
    Log {
        /// Severity.
        level: GuestLogLevel,
        /// Truncated message text.
        text: String,
    },
    /// A fatal or recoverable failure.
    Error {
        /// Human-readable description.
        message: String,
        /// Whether this error ended the sandbox.
        fatal: bool,
    },
    /// A lifecycle transition.
    Status {
        /// The state just entered.
        state: LifecycleState,
        /// Present on the transition to [`LifecycleState::Terminated`] when
        /// the isolate had become live.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        teardown: Option<TeardownReport>,
    },
    /// Periodic liveness report.
    Ping {
        /// Heap usage at probe time.
        heap: HeapStats,
        /// Milliseconds since the isolate was created.
        uptime_ms: u64,
        /// Live connections.
        connections: usize,
        /// Pending timers.
        timers: usize,
    },
}

/// One record of the outbound event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxEvent {
    /// Bot the event belongs to.
    pub bot_id: String,
    /// When the event was produced.
    pub at: DateTime<Utc>,
    /// The event itself.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SandboxEvent {
    /// Build an event stamped with the current time.
    pub fn now(bot_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            bot_id: bot_id.into(),
            at: Utc::now(),
            kind,
        }
    }

    /// Whether this is the terminal status record.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Status {
                state: LifecycleState::Terminated,
                ..
            }
        )
    }
}

/// Sending half of the event stream, bound to one bot.
#[derive(Debug, Clone)]
pub struct EventSink {
    bot_id: String,
    tx: mpsc::UnboundedSender<SandboxEvent>,
}

impl EventSink {
    /// Bind a sender to a bot id.
    pub fn new(bot_id: impl Into<String>, tx: mpsc::UnboundedSender<SandboxEvent>) -> Self {
        Self {
            bot_id: bot_id.into(),
            tx,
        }
    }

    /// The bot this sink reports for.
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Emit an event. A dropped receiver is not an error for the sandbox.
    pub fn emit(&self, kind: EventKind) {
        if self.tx.send(SandboxEvent::now(&self.bot_id, kind)).is_err() {
            tracing::trace!(bot = %self.bot_id, "event receiver dropped");
        }
    }

    /// Forward an event produced elsewhere (a worker process) unchanged.
    pub fn forward(&self, event: SandboxEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(bot = %self.bot_id, "event receiver dropped");
        }
    }

    /// Emit a log record.
    pub fn log(&self, level: GuestLogLevel, text: String) {
        self.emit(EventKind::Log { level, text });
    }

    /// Emit an error record.
    pub fn error(&self, message: impl Into<String>, fatal: bool) {
        self.emit(EventKind::Error {
            message: message.into(),
            fatal,
        });
    }

    /// Emit a status record.
    pub fn status(&self, state: LifecycleState, teardown: Option<TeardownReport>) {
        self.emit(EventKind::Status { state, teardown });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_flat_tag() {
        let event = SandboxEvent::now(
            "alice",
            EventKind::Log {
                level: GuestLogLevel::Warn,
                text: "low health".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["bot_id"], "alice");
        assert_eq!(json["level"], "warn");

        let back: SandboxEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn status_omits_missing_teardown() {
        let event = SandboxEvent::now(
            "bob",
            EventKind::Status {
                state: LifecycleState::Running,
                teardown: None,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "running");
        assert!(json.get("teardown").is_none());
        assert!(!event.is_terminated());
    }

    #[test]
    fn unknown_level_tag_is_info() {
        assert_eq!(GuestLogLevel::from_tag("trace"), GuestLogLevel::Info);
        assert_eq!(GuestLogLevel::from_tag("error"), GuestLogLevel::Error);
    }

    #[test]
    fn usage_ratio_handles_zero_limit() {
        let stats = HeapStats::default();
        assert_eq!(stats.usage_ratio(), 0.0);
        let stats = HeapStats {
            used_bytes: 8,
            total_bytes: 10,
            limit_bytes: 16,
        };
        assert!((stats.usage_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("carol", tx);
        drop(rx);
        sink.error("nobody listening", false);
    }
}
