//! Error types for the stepwise domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type; the top-level [`Error`]
//! wraps them and knows which failures a run can recover from locally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all stepwise operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Parser errors ---
    #[error("{0}")]
    Schema(#[from] SchemaError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Transport errors ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Run policy ---
    #[error("Budget exceeded: {kind} limit of {limit} reached")]
    BudgetExceeded { kind: BudgetKind, limit: u32 },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the orchestrator recovers from this error inside the current
    /// step (feedback + retry) instead of failing the run.
    pub fn is_step_recoverable(&self) -> bool {
        match self {
            Error::Schema(_) | Error::Tool(_) => true,
            Error::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Stable snake_case name of the error kind, used in events and in the
    /// structured error returned from a failed run.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Schema(_) => "schema",
            Error::Tool(ToolError::NotFound { .. }) => "tool_not_found",
            Error::Tool(ToolError::InvalidInput { .. }) => "tool_input",
            Error::Tool(ToolError::ExecutionFailed { .. }) => "tool_execution",
            Error::Tool(ToolError::NoResult { .. }) => "tool_no_result",
            Error::Transport(_) => "transport",
            Error::Memory(_) => "memory",
            Error::BudgetExceeded { .. } => "budget_exceeded",
            Error::Cancelled { .. } => "cancelled",
            Error::Internal(_) => "internal",
        }
    }
}

// --- Bounded context errors ---

/// The model output violated the active line grammar.
#[derive(Debug, Clone, Error)]
#[error("Schema error: {message}")]
pub struct SchemaError {
    pub message: String,

    /// All text received so far, kept for diagnostic replay.
    pub raw: String,
}

impl SchemaError {
    pub fn new(message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            raw: raw.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {name} (available: {})", .available.join(", "))]
    NotFound { name: String, available: Vec<String> },

    #[error("Invalid input for {tool_name}: {reason}")]
    InvalidInput { tool_name: String, reason: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool {tool_name} returned no result")]
    NoResult { tool_name: String },
}

impl ToolError {
    /// Shorthand for a tool-raised failure.
    pub fn failed(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::ExecutionFailed {
            tool_name: tool_name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request failed: {message} (status: {status_code})")]
    Status { status_code: u16, message: String },

    #[error("Stream interrupted: {0}")]
    Interrupted(String),

    #[error("Stream error: {message}")]
    Stream {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Transport not configured: {0}")]
    NotConfigured(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

impl TransportError {
    /// Whether a caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connect(_)
            | TransportError::Timeout(_)
            | TransportError::Interrupted(_) => true,
            TransportError::Status { status_code, .. } => is_retryable_status(*status_code),
            TransportError::Stream { status_code, .. } => {
                matches!(status_code, Some(code) if is_retryable_status(*code))
            }
            TransportError::Decode(_)
            | TransportError::NotConfigured(_)
            | TransportError::Cancelled(_) => false,
        }
    }
}

/// HTTP 429, 408 and every 5xx are transient; any other status is not.
pub fn is_retryable_status(status_code: u16) -> bool {
    matches!(status_code, 408 | 429 | 500..=599)
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Which run budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    PerStep,
    Total,
    Iterations,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BudgetKind::PerStep => "per_step",
            BudgetKind::Total => "total",
            BudgetKind::Iterations => "iterations",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        for code in [429, 408, 503, 500, 502, 599] {
            assert!(is_retryable_status(code), "{code} should be retryable");
        }
        for code in [400, 401, 403, 404, 422, 200] {
            assert!(!is_retryable_status(code), "{code} should not be retryable");
        }
    }

    #[test]
    fn transport_retryability() {
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(TransportError::Interrupted("eof".into()).is_retryable());
        assert!(
            TransportError::Status {
                status_code: 503,
                message: "busy".into()
            }
            .is_retryable()
        );
        assert!(
            !TransportError::Status {
                status_code: 401,
                message: "bad key".into()
            }
            .is_retryable()
        );
        assert!(
            !TransportError::Stream {
                message: "model overloaded".into(),
                status_code: None
            }
            .is_retryable()
        );
        assert!(
            TransportError::Stream {
                message: "model overloaded".into(),
                status_code: Some(529)
            }
            .is_retryable()
        );
        assert!(!TransportError::Cancelled("stop".into()).is_retryable());
    }

    #[test]
    fn not_found_lists_available_tools() {
        let err = Error::Tool(ToolError::NotFound {
            name: "Unknown".into(),
            available: vec!["Weather".into(), "Search".into()],
        });
        assert_eq!(err.kind(), "tool_not_found");
        assert!(err.to_string().contains("Weather, Search"));
        assert!(err.is_step_recoverable());
    }

    #[test]
    fn fatal_kinds_are_not_recoverable() {
        let budget = Error::BudgetExceeded {
            kind: BudgetKind::PerStep,
            limit: 2,
        };
        assert!(!budget.is_step_recoverable());
        assert!(budget.to_string().contains("per_step"));

        let cancelled = Error::Cancelled {
            reason: "user".into(),
        };
        assert!(!cancelled.is_step_recoverable());
        assert_eq!(cancelled.kind(), "cancelled");
    }

    #[test]
    fn schema_error_keeps_raw_text() {
        let err: Error = SchemaError::new("unexpected line", "Hello there").into();
        assert!(err.is_step_recoverable());
        match err {
            Error::Schema(e) => assert_eq!(e.raw, "Hello there"),
            other => panic!("expected schema error, got {other:?}"),
        }
    }
}
