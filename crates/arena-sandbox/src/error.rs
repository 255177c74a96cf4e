//! Error types for the arena sandbox.

use thiserror::Error;

/// Errors that can occur while admitting, starting or supervising a bot.
///
/// Everything here is an *admission* or *host-level* failure. Guest-side
/// capacity pressure (connection cap, timer cap) is never an error; it is
/// encoded as sentinel return values at the bridge.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The static policy scanner rejected the source.
    #[error("bot source rejected: denied token `{token}`; the sandbox has no module, process or filesystem access")]
    PolicyDenied {
        /// The denylisted token that matched.
        token: String,
    },

    /// The source is empty or otherwise unusable.
    #[error("bot source invalid: {reason}")]
    InvalidSource {
        /// What went wrong.
        reason: String,
    },

    /// The source exceeds the configured maximum size.
    #[error("bot source exceeds maximum size of {max} bytes (got {actual})")]
    SourceTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The source file could not be read.
    #[error("failed to read bot source from {path}: {source}")]
    SourceUnavailable {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The isolate or its prelude could not be constructed.
    #[error("isolate construction failed: {message}")]
    IsolateConstruction {
        /// Engine-provided detail.
        message: String,
    },

    /// The bot threw while its top-level code ran.
    #[error("bot setup failed: {message}")]
    SetupFailed {
        /// The exception text.
        message: String,
    },

    /// The setup phase did not complete in time.
    #[error("bot setup timed out after {timeout_ms}ms")]
    SetupTimeout {
        /// Configured setup timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The isolate approached its heap ceiling and was terminated.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Too many sandboxes are already running.
    #[error("worker limit reached (max {max} concurrent sandboxes)")]
    WorkerLimit {
        /// Maximum allowed concurrent sandboxes.
        max: usize,
    },

    /// The bot registry could not resolve a bot.
    #[error("bot not found in registry: {0}")]
    UnknownBot(String),

    /// Generic host-side failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Event or message serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Whether this error happened before the isolate became live.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::PolicyDenied { .. }
                | Self::InvalidSource { .. }
                | Self::SourceTooLarge { .. }
                | Self::SourceUnavailable { .. }
                | Self::IsolateConstruction { .. }
                | Self::SetupFailed { .. }
                | Self::SetupTimeout { .. }
                | Self::WorkerLimit { .. }
                | Self::UnknownBot(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_denied_names_token() {
        let err = SandboxError::PolicyDenied {
            token: "require".into(),
        };
        assert!(err.to_string().contains("`require`"));
        assert!(err.is_admission());
    }

    #[test]
    fn heap_limit_is_not_admission() {
        assert!(!SandboxError::HeapLimitExceeded.is_admission());
        assert!(SandboxError::SetupTimeout { timeout_ms: 10 }.is_admission());
    }
}
