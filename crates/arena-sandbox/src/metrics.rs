//! Prometheus metrics derived from the sandbox event stream.
//!
//! Only compiled with the `metrics` feature. Consumers feed every
//! [`SandboxEvent`] they read into [`SandboxMetrics::observe`].

use std::collections::HashSet;
use std::sync::atomic::AtomicI64;

use parking_lot::Mutex;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::events::{EventKind, LifecycleState, SandboxEvent};

/// Label set for the event counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    /// `log`, `error`, `status` or `ping`.
    pub kind: String,
}

/// Label set for the error counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// `fatal` or `recoverable`.
    pub severity: String,
}

/// Sandbox metrics.
pub struct SandboxMetrics {
    /// Events seen, by kind.
    pub events_total: Family<EventLabels, Counter>,
    /// Error events, by severity.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Sandboxes that reached the terminal state.
    pub terminations_total: Counter,
    /// Sandboxes currently running.
    pub sandboxes_running: Gauge<i64, AtomicI64>,
    /// Heap usage ratio reported by liveness probes.
    pub heap_usage_ratio: Histogram,
    running: Mutex<HashSet<String>>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let events_total = Family::default();
        registry.register(
            "arena_sandbox_events_total",
            "Sandbox events by kind",
            events_total.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "arena_sandbox_errors_total",
            "Sandbox error events by severity",
            errors_total.clone(),
        );

        let terminations_total = Counter::default();
        registry.register(
            "arena_sandbox_terminations_total",
            "Sandboxes that reached the terminated state",
            terminations_total.clone(),
        );

        let sandboxes_running = Gauge::default();
        registry.register(
            "arena_sandboxes_running",
            "Sandboxes currently running",
            sandboxes_running.clone(),
        );

        let heap_usage_ratio =
            Histogram::new([0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 1.0].into_iter());
        registry.register(
            "arena_sandbox_heap_usage_ratio",
            "Heap usage relative to the ceiling at probe time",
            heap_usage_ratio.clone(),
        );

        Self {
            events_total,
            errors_total,
            terminations_total,
            sandboxes_running,
            heap_usage_ratio,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Account for one event.
    pub fn observe(&self, event: &SandboxEvent) {
        let kind = match &event.kind {
            EventKind::Log { .. } => "log",
            EventKind::Error { .. } => "error",
            EventKind::Status { .. } => "status",
            EventKind::Ping { .. } => "ping",
        };
        self.events_total
            .get_or_create(&EventLabels { kind: kind.into() })
            .inc();

        match &event.kind {
            EventKind::Error { fatal, .. } => {
                let severity = if *fatal { "fatal" } else { "recoverable" };
                self.errors_total
                    .get_or_create(&ErrorLabels {
                        severity: severity.into(),
                    })
                    .inc();
            }
            EventKind::Status { state, .. } => {
                let mut running = self.running.lock();
                match state {
                    LifecycleState::Running => {
                        running.insert(event.bot_id.clone());
                    }
                    LifecycleState::Terminated => {
                        running.remove(&event.bot_id);
                        self.terminations_total.inc();
                    }
                    LifecycleState::Created | LifecycleState::Terminating => {}
                }
                self.sandboxes_running.set(running.len() as i64);
            }
            EventKind::Ping { heap, .. } => {
                self.heap_usage_ratio.observe(heap.usage_ratio());
            }
            EventKind::Log { .. } => {}
        }
    }
}
