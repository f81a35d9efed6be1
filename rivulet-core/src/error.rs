//! Control-plane error type.
//!
//! Data-path code (operator invocation, queue offers, downstream sends) works
//! with `anyhow::Result`. Everything a control-plane caller can observe is an
//! [`EngineError`], which is `Clone` so that one failure can resolve several
//! coalesced command futures.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Caller passed an argument that does not match the current state,
    /// e.g. a stale flow version or an unknown pipeline id.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Operation is not allowed in the current status.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A reconfiguration step failed after the affected pipelines were stopped.
    /// The flow version is left unchanged.
    #[error("{operation} failed: {reason}")]
    Reconfiguration { operation: String, reason: String },

    /// Flow start failed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Internal invariant broken; indicates a bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A pipeline replica failed while running.
    #[error("pipeline replica {replica} failed: {reason}")]
    ReplicaFailed { replica: String, reason: String },
}

impl EngineError {
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        EngineError::IllegalArgument(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        EngineError::IllegalState(msg.into())
    }

    pub fn reconfiguration(operation: impl Into<String>, err: &anyhow::Error) -> Self {
        EngineError::Reconfiguration {
            operation: operation.into(),
            reason: format!("{:#}", err),
        }
    }

    pub fn initialization(err: &anyhow::Error) -> Self {
        EngineError::Initialization(format!("{:#}", err))
    }
}

/// Result alias for control-plane operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
