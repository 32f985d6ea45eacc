//! Error taxonomy for the Text-to-SQL pipeline.
//!
//! The orchestrator is the only place that decides retry-vs-propagate;
//! guard and executor construct these errors but never retry themselves.

use thiserror::Error;

/// Sub-kind of an execution failure, kept distinct so timeouts are never
/// conflated with driver-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailureKind {
    /// The statement exceeded the configured execution deadline.
    Timeout,
    /// The database driver rejected or aborted the statement.
    Driver,
}

impl std::fmt::Display for ExecutionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionFailureKind::Timeout => write!(f, "timeout"),
            ExecutionFailureKind::Driver => write!(f, "driver_error"),
        }
    }
}

/// Failure kinds surfaced by the Text-to-SQL pipeline.
#[derive(Debug, Error)]
pub enum AgentSqlError {
    /// The safety guard rejected a candidate SQL string.
    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },

    /// The bounded executor failed (timeout or driver error).
    #[error("execution failure ({kind}): {message}")]
    ExecutionFailure {
        kind: ExecutionFailureKind,
        message: String,
    },

    /// The generator collaborator itself could not be called at all.
    #[error("generator unavailable: {message}")]
    UpstreamUnavailable { message: String },
}

impl AgentSqlError {
    pub fn policy(reason: impl Into<String>) -> Self {
        AgentSqlError::PolicyViolation {
            reason: reason.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        AgentSqlError::ExecutionFailure {
            kind: ExecutionFailureKind::Timeout,
            message: message.into(),
        }
    }

    pub fn driver(message: impl Into<String>) -> Self {
        AgentSqlError::ExecutionFailure {
            kind: ExecutionFailureKind::Driver,
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        AgentSqlError::UpstreamUnavailable {
            message: message.into(),
        }
    }

    /// Whether the orchestrator is permitted to recover from this failure
    /// by re-invoking the generator with feedback.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentSqlError::PolicyViolation { .. } | AgentSqlError::ExecutionFailure { .. }
        )
    }

    /// Error text fed back to the generator verbatim on the next attempt.
    pub fn feedback(&self) -> String {
        match self {
            AgentSqlError::PolicyViolation { reason } => {
                format!("PolicyViolation: {reason}")
            }
            AgentSqlError::ExecutionFailure { kind, message } => {
                format!("ExecutionFailure({kind}): {message}")
            }
            AgentSqlError::UpstreamUnavailable { message } => {
                format!("UpstreamUnavailable: {message}")
            }
        }
    }
}
