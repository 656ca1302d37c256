//! Error types for the jsplay sandbox.

use thiserror::Error;

use crate::result::FaultKind;

/// Errors that can occur during sandbox execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The source failed to parse, or uses ES module syntax.
    #[error("{message}")]
    Syntax {
        /// Summarized, redacted parser message.
        message: String,
    },

    /// The script threw, or its completion promise rejected.
    #[error("{message}")]
    Runtime {
        /// Summarized, redacted exception message.
        message: String,
    },

    /// `require` named a module the package directory does not have.
    #[error("{message}")]
    ModuleNotFound {
        /// The `Cannot find module` message.
        message: String,
    },

    /// Execution ran past its deadline and was terminated.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Source exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// Generic execution failure inside the host.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Serializing a message failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// The fault class reported to callers.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Syntax { .. } => FaultKind::Syntax,
            Self::Runtime { .. } => FaultKind::Runtime,
            Self::ModuleNotFound { .. } => FaultKind::ModuleNotFound,
            Self::Timeout { .. } => FaultKind::Timeout,
            Self::HeapLimitExceeded => FaultKind::HeapLimit,
            Self::CodeTooLarge { .. } => FaultKind::TooLarge,
            Self::ConcurrencyLimit { .. } => FaultKind::ConcurrencyLimit,
            Self::Execution(_) | Self::Serialization(_) => FaultKind::Internal,
        }
    }

    /// Classify a raw engine error from running a script.
    ///
    /// The headline is summarized and redacted; a missing module becomes
    /// [`SandboxError::ModuleNotFound`]. Parse failures never get here, the
    /// executor reports them before the script runs.
    pub fn from_script_fault(raw: &str) -> Self {
        let message = crate::redact::fault_summary(raw);
        if message.contains("Cannot find module '") {
            Self::ModuleNotFound { message }
        } else {
            Self::Runtime { message }
        }
    }
}
