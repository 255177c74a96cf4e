#![warn(missing_docs)]

//! # arena-sandbox
//!
//! V8 sandbox for untrusted arena bot scripts.
//!
//! Every bot runs in its own deno_core isolate on its own OS worker (a
//! dedicated thread, or a dedicated child process). The isolate has no
//! filesystem, process or module access; the only bridge to the host is a
//! fixed set of ops for logging, loopback WebSocket connections and timers.
//! After a time-boxed setup phase the isolate is purely reactive: it runs only
//! when the [`socket`] proxy or the [`timer`] scheduler re-enters it.
//!
//! ## Security model
//!
//! - **V8 isolate**: separate heap per bot with a hard ceiling
//! - **Allow-list realm**: the prelude rebuilds the global scope from ECMAScript
//!   intrinsics plus the capability objects, nothing else
//! - **Pre-execution scan**: denylisted tokens rejected before any isolate exists
//! - **Typed re-entry**: events reach the guest as direct function calls with
//!   primitive arguments, never as generated code
//! - **Bounded re-entry**: a watchdog interrupts handlers that overrun
//! - **Sentinel limits**: connection and timer caps are values, not exceptions

pub mod bridge;
pub mod error;
pub mod events;
pub mod host;
pub mod ipc;
pub mod manager;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod prelude;
pub mod scanner;
pub mod socket;
mod supervisor;
pub mod timer;
mod watchdog;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use error::SandboxError;
pub use events::{EventKind, LifecycleState, SandboxEvent};
pub use manager::{ExecutionMode, SandboxConfig, SandboxHandle, SandboxManager};

/// Where a bot's script comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScriptSource {
    /// Read the script from a file.
    Path(PathBuf),
    /// The script text itself.
    Inline(String),
}

impl ScriptSource {
    /// Resolve to script text.
    pub async fn load(&self) -> Result<String, SandboxError> {
        match self {
            Self::Inline(text) => Ok(text.clone()),
            Self::Path(path) => tokio::fs::read_to_string(path).await.map_err(|source| {
                SandboxError::SourceUnavailable {
                    path: path.display().to_string(),
                    source,
                }
            }),
        }
    }
}

/// A request to start one bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRequest {
    /// Bot identifier, used to tag every event.
    pub bot_id: String,
    /// The bot's script.
    pub source: ScriptSource,
    /// Socket destination the bot is expected to connect to; exposed to the
    /// guest as `bot.endpoint`.
    pub endpoint: String,
}

/// Trait for resolving bots from the surrounding product's registry.
///
/// The sandbox does not validate bot metadata beyond what the scanner checks
/// on the source text.
#[async_trait::async_trait]
pub trait BotRegistry: Send + Sync {
    /// Look up a bot by identifier.
    async fn lookup(&self, bot_id: &str) -> Result<BotRequest, SandboxError>;
}

/// Host-side event waiting to re-enter a guest.
#[derive(Debug)]
pub enum HostEvent {
    /// A proxied socket produced an event.
    Socket {
        /// Connection handle.
        handle: i32,
        /// What happened.
        event: socket::SocketEvent,
    },
    /// A timer fired.
    Timer {
        /// Timer id.
        id: u32,
    },
}
