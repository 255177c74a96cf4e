//! CPU watchdog and heap guard for one isolate.
//!
//! The watchdog is a long-lived thread that can be armed for one guest
//! entry at a time. If the entry outlives its budget the thread terminates
//! V8 execution; disarming afterwards cancels the termination so the isolate
//! stays usable for the next entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use deno_core::v8;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct ArmState {
    generation: u64,
    armed: bool,
    fired: bool,
}

enum Command {
    Arm { generation: u64, timeout: Duration },
    Disarm,
}

/// Re-armable execution watchdog.
pub(crate) struct Watchdog {
    handle: v8::IsolateHandle,
    state: Arc<Mutex<ArmState>>,
    commands: Option<mpsc::Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the watchdog thread for the isolate behind `handle`.
    pub(crate) fn spawn(handle: v8::IsolateHandle, bot_id: &str) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(ArmState::default()));
        let (tx, rx) = mpsc::channel();
        let thread_state = state.clone();
        let thread_handle = handle.clone();
        let thread = std::thread::Builder::new()
            .name(format!("arena-watchdog-{}", thread_name_safe(bot_id)))
            .spawn(move || watch(rx, thread_state, thread_handle))?;

        Ok(Self {
            handle,
            state,
            commands: Some(tx),
            thread: Some(thread),
        })
    }

    /// Arm for one entry lasting at most `timeout`.
    pub(crate) fn arm(&self, timeout: Duration) {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.armed = true;
            state.fired = false;
            state.generation
        };
        if let Some(tx) = &self.commands {
            let _ = tx.send(Command::Arm {
                generation,
                timeout,
            });
        }
    }

    /// Disarm after the entry returned. Returns `true` if the budget ran out,
    /// in which case the pending termination is cancelled.
    pub(crate) fn disarm(&self) -> bool {
        let fired = {
            let mut state = self.state.lock();
            state.armed = false;
            std::mem::take(&mut state.fired)
        };
        if let Some(tx) = &self.commands {
            let _ = tx.send(Command::Disarm);
        }
        if fired {
            self.handle.cancel_terminate_execution();
        }
        fired
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Closing the channel ends the thread.
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(rx: mpsc::Receiver<Command>, state: Arc<Mutex<ArmState>>, handle: v8::IsolateHandle) {
    let mut pending: Option<(u64, Instant)> = None;
    loop {
        let command = match pending {
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
            Some((generation, deadline)) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        fire(&state, &handle, generation);
                        pending = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        };
        pending = match command {
            Command::Arm {
                generation,
                timeout,
            } => Some((generation, Instant::now() + timeout)),
            Command::Disarm => None,
        };
    }
}

fn fire(state: &Mutex<ArmState>, handle: &v8::IsolateHandle, generation: u64) {
    let mut state = state.lock();
    // A stale deadline from an entry that already returned must not fire.
    if state.armed && state.generation == generation {
        state.fired = true;
        handle.terminate_execution();
    }
}

pub(crate) fn thread_name_safe(bot_id: &str) -> String {
    bot_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect()
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the Box<HeapLimitState> owned by a HeapGuard.
    // The guard is declared after the JsRuntime in `Engine`, so it outlives
    // the isolate that can invoke this callback.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Owns the heap-limit callback state for one isolate.
pub(crate) struct HeapGuard {
    state: Box<HeapLimitState>,
}

impl HeapGuard {
    /// Register the near-heap-limit callback on `isolate`.
    pub(crate) fn install(isolate: &mut v8::OwnedIsolate) -> Self {
        let state = Box::new(HeapLimitState {
            handle: isolate.thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        isolate.add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*state as *const HeapLimitState as *mut std::ffi::c_void,
        );
        Self { state }
    }

    /// Whether the heap ceiling was hit.
    pub(crate) fn triggered(&self) -> bool {
        self.state.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_names_are_sanitized() {
        assert_eq!(thread_name_safe("bot-1_a"), "bot-1_a");
        assert_eq!(thread_name_safe("a\0b c/d"), "abcd");
        assert_eq!(thread_name_safe(&"x".repeat(100)).len(), 32);
    }
}
