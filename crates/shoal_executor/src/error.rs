//! Error taxonomy for the executor's public surface.
//!
//! Transient admin-interface failures never show up here: collaborator
//! traits return `anyhow::Result` and the progress loop logs and retries
//! them. The variants below are the failures a caller can actually act on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A user action raced with an execution that is already in flight.
    #[error("ongoing execution: {0}")]
    OngoingExecution(String),

    /// An internal invariant does not hold (uuid mismatch, unexpected
    /// executor state, cancellation reported during a regular submission).
    #[error("illegal executor state: {0}")]
    IllegalState(String),

    /// A caller-supplied value failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking wait was cut short by executor shutdown.
    #[error("interrupted: {0}")]
    Interrupted(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
