//! Parent/worker protocol for child-process sandboxes.
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload. The
//! parent sends one [`ParentMessage::Start`], then at most one
//! [`ParentMessage::Stop`]; the worker streams [`ChildMessage::Event`]s until
//! it reports the terminal status and exits.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::events::SandboxEvent;
use crate::manager::{ExecutionMode, SandboxConfig};
use crate::BotRequest;

/// Default maximum IPC frame: 8 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Run this bot. The source is always inline and already admitted.
    Start {
        /// The bot to run.
        request: BotRequest,
        /// Limits for its isolate.
        config: WorkerConfig,
    },
    /// Terminate the bot and exit.
    Stop,
}

/// Worker to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// One record of the bot's event stream.
    Event {
        /// The event, forwarded unchanged.
        event: SandboxEvent,
    },
}

/// Isolate limits shipped to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// V8 heap ceiling in bytes.
    pub max_heap_size: usize,
    /// Connection cap.
    pub max_connections: usize,
    /// Timer cap.
    pub max_timers: usize,
    /// Source size cap in bytes.
    pub max_source_size: usize,
    /// Setup budget.
    pub setup_timeout_ms: u64,
    /// Per-callback budget.
    pub callback_timeout_ms: u64,
    /// Outbound socket text cap.
    pub max_send_size: usize,
    /// Guest log text cap.
    pub max_log_size: usize,
    /// Liveness probe period.
    pub ping_interval_ms: u64,
    /// Heap usage ratio that counts as a breach.
    pub heap_breach_ratio: f64,
    /// Consecutive breaches before termination.
    pub heap_breach_probes: u32,
    /// Unhandled rejections end the bot.
    #[serde(default)]
    pub fatal_rejections: bool,
    /// Maximum IPC frame size.
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl From<&SandboxConfig> for WorkerConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_heap_size: config.max_heap_size,
            max_connections: config.max_connections,
            max_timers: config.max_timers,
            max_source_size: config.max_source_size,
            setup_timeout_ms: config.setup_timeout.as_millis() as u64,
            callback_timeout_ms: config.callback_timeout.as_millis() as u64,
            max_send_size: config.max_send_size,
            max_log_size: config.max_log_size,
            ping_interval_ms: config.ping_interval.as_millis() as u64,
            heap_breach_ratio: config.heap_breach_ratio,
            heap_breach_probes: config.heap_breach_probes,
            fatal_rejections: config.fatal_rejections,
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }
}

impl WorkerConfig {
    /// The config the worker's own manager runs with: in-process, one bot.
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            execution_mode: ExecutionMode::InProcess,
            max_workers: 1,
            max_source_size: self.max_source_size,
            max_heap_size: self.max_heap_size,
            max_connections: self.max_connections,
            max_timers: self.max_timers,
            setup_timeout: Duration::from_millis(self.setup_timeout_ms),
            callback_timeout: Duration::from_millis(self.callback_timeout_ms),
            max_send_size: self.max_send_size,
            max_log_size: self.max_log_size,
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            heap_breach_ratio: self.heap_breach_ratio,
            heap_breach_probes: self.heap_breach_probes,
            fatal_rejections: self.fatal_rejections,
            stop_grace: SandboxConfig::default().stop_grace,
            max_ipc_message_size: self.max_ipc_message_size,
        }
    }
}

fn invalid_data(message: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Write one frame.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> io::Result<()> {
    let payload = serde_json::to_vec(msg).map_err(invalid_data)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| invalid_data(format!("IPC payload too large: {} bytes", payload.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one frame of at most `max_size` bytes.
///
/// Returns `None` on a clean EOF between frames.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(invalid_data(format!(
            "IPC message too large: {len} bytes (limit: {max_size} bytes)"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map(Some).map_err(invalid_data)
}
