//! The reply to one execution request.

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::value::SerializedValue;

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The source did not parse.
    Syntax,
    /// The script threw.
    Runtime,
    /// The deadline passed.
    Timeout,
    /// The isolate ran out of heap.
    HeapLimit,
    /// `require` found nothing.
    ModuleNotFound,
    /// Too many executions in flight.
    ConcurrencyLimit,
    /// The source is over the size limit.
    TooLarge,
    /// The host failed, not the script.
    Internal,
}

impl FaultKind {
    /// Stable lowercase name, used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Runtime => "runtime",
            Self::Timeout => "timeout",
            Self::HeapLimit => "heap_limit",
            Self::ModuleNotFound => "module_not_found",
            Self::ConcurrencyLimit => "concurrency_limit",
            Self::TooLarge => "too_large",
            Self::Internal => "internal",
        }
    }
}

/// Outcome of `execute`: exactly one of a value or a fault message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecutionResult {
    /// The script completed.
    Success {
        /// Its completion value.
        value: SerializedValue,
    },
    /// The script or the sandbox failed.
    Failure {
        /// Fault class.
        kind: FaultKind,
        /// Human-readable, redacted description.
        message: String,
    },
}

impl ExecutionResult {
    /// Whether this is a `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&SerializedValue> {
        match self {
            Self::Success { value } => Some(value),
            Self::Failure { .. } => None,
        }
    }

    /// The failure message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { message, .. } => Some(message),
        }
    }

    /// The fault kind, if any.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl From<Result<SerializedValue, SandboxError>> for ExecutionResult {
    fn from(result: Result<SerializedValue, SandboxError>) -> Self {
        match result {
            Ok(value) => Self::Success { value },
            Err(e) => Self::Failure {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}
