//! Host bridge: the deno_core ops installed into every bot isolate.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress
//! `missing_docs` at the module level.
//!
//! Every op is synchronous and takes primitive arguments only. None of them
//! throws into the guest: policy rejections are sentinel values, and unknown
//! handles are silent no-ops.
#![allow(missing_docs)]

use deno_core::op2;
use deno_core::OpState;

use crate::events::{EventSink, GuestLogLevel};
use crate::socket::{truncate_to_boundary, SocketProxy};
use crate::timer::{TimerKind, TimerScheduler};

/// Per-isolate bridge state stored in OpState.
pub struct BridgeState {
    /// Where guest log records go.
    pub sink: EventSink,
    /// `{ id, endpoint }` handed to the prelude.
    pub identity_json: String,
    /// Log text cap in bytes.
    pub max_log_size: usize,
}

/// Unhandled rejections reported by the prelude since the last drain.
#[derive(Debug, Default)]
pub struct PendingRejections(pub Vec<String>);

/// Emit one guest log record.
#[op2(fast)]
pub fn op_arena_log(state: &mut OpState, #[string] level: &str, #[string] text: &str) {
    let bridge = state.borrow::<BridgeState>();
    let level = GuestLogLevel::from_tag(level);
    let text = truncate_to_boundary(text, bridge.max_log_size);
    tracing::trace!(
        target: "arena::sandbox::guest",
        bot = %bridge.sink.bot_id(),
        level = ?level,
        "{}",
        text
    );
    bridge.sink.log(level, text.to_string());
}

/// Open a proxied socket. Returns a handle, or `-1` / `-2`.
#[op2(fast)]
pub fn op_arena_socket_open(state: &mut OpState, #[string] url: &str) -> i32 {
    state.borrow_mut::<SocketProxy>().open(url).as_raw()
}

/// Send text on an open socket.
#[op2(fast)]
pub fn op_arena_socket_send(state: &mut OpState, handle: i32, #[string] text: &str) {
    state.borrow_mut::<SocketProxy>().send(handle, text);
}

/// Start closing a socket.
#[op2(fast)]
pub fn op_arena_socket_close(state: &mut OpState, handle: i32) {
    state.borrow_mut::<SocketProxy>().close(handle);
}

/// Schedule a one-shot timer. Returns whether it was accepted.
#[op2(fast)]
pub fn op_arena_timer_start(state: &mut OpState, id: u32, delay_ms: f64) -> bool {
    state
        .borrow_mut::<TimerScheduler>()
        .schedule(id, delay_ms, TimerKind::Once)
}

/// Schedule a repeating timer. Returns whether it was accepted.
#[op2(fast)]
pub fn op_arena_timer_repeat(state: &mut OpState, id: u32, delay_ms: f64) -> bool {
    state
        .borrow_mut::<TimerScheduler>()
        .schedule(id, delay_ms, TimerKind::Repeat)
}

/// Cancel a timer.
#[op2(fast)]
pub fn op_arena_timer_cancel(state: &mut OpState, id: u32) {
    state.borrow_mut::<TimerScheduler>().cancel(id);
}

/// Bot identity for the prelude.
#[op2]
#[string]
pub fn op_arena_identity(state: &mut OpState) -> String {
    state.borrow::<BridgeState>().identity_json.clone()
}

/// Record an unhandled rejection from a guest callback.
#[op2(fast)]
pub fn op_arena_report_rejection(state: &mut OpState, #[string] text: &str) {
    let max = state.borrow::<BridgeState>().max_log_size;
    let text = truncate_to_boundary(text, max).to_string();
    state.borrow_mut::<PendingRejections>().0.push(text);
}

deno_core::extension!(
    arena_bridge,
    ops = [
        op_arena_log,
        op_arena_socket_open,
        op_arena_socket_send,
        op_arena_socket_close,
        op_arena_timer_start,
        op_arena_timer_repeat,
        op_arena_timer_cancel,
        op_arena_identity,
        op_arena_report_rejection
    ],
);

/// Build the identity JSON handed to the prelude.
pub(crate) fn identity_json(bot_id: &str, endpoint: &str) -> String {
    serde_json::json!({ "id": bot_id, "endpoint": endpoint }).to_string()
}
