//! Timer scheduler: owns real tokio timers on behalf of one guest.
//!
//! Fires are delivered as [`HostEvent::Timer`] into the isolate's event
//! channel, in the order the tokio timer wheel releases them. A repeating
//! timer has at most one undelivered fire queued; ticks that elapse while a
//! fire is still pending are coalesced into it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::HostEvent;

/// Upper bound for any requested delay.
pub const MAX_DELAY_MS: u64 = 60_000;

/// Lower bound for repeating timers.
pub const MIN_REPEAT_MS: u64 = 50;

/// One-shot or repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// `setTimeout`
    Once,
    /// `setInterval`
    Repeat,
}

/// Clamp a guest-requested delay into the safe range for its kind.
///
/// Non-finite and negative values clamp to the minimum.
pub fn clamp_delay(delay_ms: f64, kind: TimerKind) -> Duration {
    let min = match kind {
        TimerKind::Once => 0,
        TimerKind::Repeat => MIN_REPEAT_MS,
    };
    let ms = if delay_ms.is_finite() && delay_ms > 0.0 {
        (delay_ms as u64).clamp(min, MAX_DELAY_MS)
    } else {
        min
    };
    Duration::from_millis(ms)
}

struct TimerEntry {
    kind: TimerKind,
    task: JoinHandle<()>,
    /// Set while a fire sits in the event channel.
    pending: Arc<AtomicBool>,
}

/// Per-isolate timer table.
pub struct TimerScheduler {
    timers: HashMap<u32, TimerEntry>,
    last_id: u32,
    max_timers: usize,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl TimerScheduler {
    /// Create an empty scheduler that reports into `events`.
    pub fn new(max_timers: usize, events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self {
            timers: HashMap::new(),
            last_id: 0,
            max_timers,
            events,
        }
    }

    /// Schedule timer `id`. Returns `false` (and schedules nothing) when the
    /// cap is reached or `id` is not strictly greater than every id seen so
    /// far, which keeps handles unique for the isolate's lifetime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&mut self, id: u32, delay_ms: f64, kind: TimerKind) -> bool {
        if id <= self.last_id {
            tracing::debug!(id, last_id = self.last_id, "timer id rejected: not fresh");
            return false;
        }
        if self.timers.len() >= self.max_timers {
            tracing::debug!(id, max = self.max_timers, "timer dropped: cap reached");
            return false;
        }
        self.last_id = id;

        let delay = clamp_delay(delay_ms, kind);
        let events = self.events.clone();
        let pending = Arc::new(AtomicBool::new(false));
        let task = match kind {
            TimerKind::Once => tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(HostEvent::Timer { id });
            }),
            TimerKind::Repeat => {
                let pending = pending.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval_at(Instant::now() + delay, delay);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        if pending.swap(true, Ordering::AcqRel) {
                            tracing::trace!(id, "interval tick coalesced");
                            continue;
                        }
                        if events.send(HostEvent::Timer { id }).is_err() {
                            break;
                        }
                    }
                })
            }
        };

        self.timers.insert(
            id,
            TimerEntry {
                kind,
                task,
                pending,
            },
        );
        true
    }

    /// Cancel a pending timer. Unknown ids are ignored.
    pub fn cancel(&mut self, id: u32) -> bool {
        match self.timers.remove(&id) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Account for a fire event. Returns `true` if the guest should be
    /// re-entered; one-shot timers are removed here, before the callback runs.
    /// For a repeating timer this re-opens the slot for its next tick.
    pub fn take_fire(&mut self, id: u32) -> bool {
        match self.timers.get(&id) {
            Some(entry) if entry.kind == TimerKind::Once => {
                self.timers.remove(&id);
                true
            }
            Some(entry) => {
                entry.pending.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Clear every timer. Returns how many were pending.
    pub fn shutdown(&mut self) -> usize {
        let count = self.timers.len();
        for (_, entry) in self.timers.drain() {
            entry.task.abort();
        }
        count
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(max: usize) -> (TimerScheduler, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerScheduler::new(max, tx), rx)
    }

    fn fired_id(event: HostEvent) -> u32 {
        match event {
            HostEvent::Timer { id } => id,
            HostEvent::Socket { .. } => panic!("expected timer event"),
        }
    }

    #[test]
    fn clamps_one_shot_delays() {
        assert_eq!(clamp_delay(-5.0, TimerKind::Once), Duration::ZERO);
        assert_eq!(clamp_delay(f64::NAN, TimerKind::Once), Duration::ZERO);
        assert_eq!(clamp_delay(250.7, TimerKind::Once), Duration::from_millis(250));
        assert_eq!(
            clamp_delay(1e12, TimerKind::Once),
            Duration::from_millis(MAX_DELAY_MS)
        );
        assert_eq!(
            clamp_delay(f64::INFINITY, TimerKind::Once),
            Duration::ZERO
        );
    }

    #[test]
    fn clamps_repeating_delays() {
        assert_eq!(
            clamp_delay(0.0, TimerKind::Repeat),
            Duration::from_millis(MIN_REPEAT_MS)
        );
        assert_eq!(
            clamp_delay(10.0, TimerKind::Repeat),
            Duration::from_millis(MIN_REPEAT_MS)
        );
        assert_eq!(
            clamp_delay(70_000.0, TimerKind::Repeat),
            Duration::from_millis(MAX_DELAY_MS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_and_is_removed() {
        let (mut timers, mut rx) = scheduler(10);
        assert!(timers.schedule(1, 100.0, TimerKind::Once));
        assert_eq!(fired_id(rx.recv().await.unwrap()), 1);
        assert!(timers.take_fire(1));
        assert!(timers.is_empty());
        // a duplicate or late fire no longer reaches the guest
        assert!(!timers.take_fire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_stays_until_cancelled() {
        let (mut timers, mut rx) = scheduler(10);
        assert!(timers.schedule(1, 50.0, TimerKind::Repeat));
        for _ in 0..3 {
            assert_eq!(fired_id(rx.recv().await.unwrap()), 1);
            assert!(timers.take_fire(1));
        }
        assert_eq!(timers.len(), 1);
        assert!(timers.cancel(1));
        assert!(!timers.take_fire(1));
        assert!(!timers.cancel(1));
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_interval_ticks_coalesce() {
        let (mut timers, mut rx) = scheduler(10);
        assert!(timers.schedule(1, 50.0, TimerKind::Repeat));

        // Ten periods pass while the first fire is still undelivered.
        tokio::time::sleep(Duration::from_millis(520)).await;
        assert_eq!(fired_id(rx.try_recv().unwrap()), 1);
        assert!(rx.try_recv().is_err(), "ticks must not pile up");

        // Once the fire is taken the next tick is queued again.
        assert!(timers.take_fire(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired_id(rx.try_recv().unwrap()), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut rx) = scheduler(10);
        assert!(timers.schedule(1, 100.0, TimerKind::Once));
        assert!(timers.schedule(2, 200.0, TimerKind::Once));
        assert!(timers.cancel(1));
        assert_eq!(fired_id(rx.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn cap_drops_excess_timers() {
        let (mut timers, _rx) = scheduler(100);
        for id in 1..=100 {
            assert!(timers.schedule(id, 60_000.0, TimerKind::Once));
        }
        assert!(!timers.schedule(101, 10.0, TimerKind::Once));
        assert_eq!(timers.len(), 100);

        // freeing a slot lets a later id in
        timers.cancel(5);
        assert!(timers.schedule(102, 10.0, TimerKind::Once));
    }

    #[tokio::test]
    async fn ids_must_be_fresh() {
        let (mut timers, _rx) = scheduler(10);
        assert!(!timers.schedule(0, 10.0, TimerKind::Once));
        assert!(timers.schedule(3, 10.0, TimerKind::Once));
        timers.cancel(3);
        assert!(!timers.schedule(3, 10.0, TimerKind::Once));
        assert!(!timers.schedule(2, 10.0, TimerKind::Once));
        assert!(timers.schedule(4, 10.0, TimerKind::Once));
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let (mut timers, _rx) = scheduler(10);
        timers.schedule(1, 1000.0, TimerKind::Once);
        timers.schedule(2, 1000.0, TimerKind::Repeat);
        assert_eq!(timers.shutdown(), 2);
        assert!(timers.is_empty());
    }
}
