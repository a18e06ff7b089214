// Error types for the worker farm

use thiserror::Error;

use taskfarm_protocol::{ErrorKind, ErrorPayload};

/// Result type alias for farm operations
pub type Result<T> = std::result::Result<T, FarmError>;

/// Errors surfaced by the farm and its workers.
///
/// Failures are always scoped to the narrowest affected call: a task failure
/// reaches only that call's caller, a worker crash reaches only the calls
/// pending on that worker, and nothing here ever tears down the farm itself.
#[derive(Debug, Error)]
pub enum FarmError {
    /// Child process could not be created or exited before signaling ready
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The task module reported a failure for this call
    #[error("task failed: {0}")]
    Task(String),

    /// The worker's channel closed while this call was outstanding
    #[error("worker exited while the call was outstanding")]
    WorkerExited,

    /// The worker was stopped while this call was outstanding
    #[error("worker stopped while the call was outstanding")]
    WorkerStopped,

    /// A bidirectional request named an unregistered handler
    #[error("no handler registered for '{0}'")]
    HandlerNotFound(String),

    /// Call submitted after shutdown began
    #[error("farm has ended and no longer accepts calls")]
    Ended,

    /// Worker channel I/O failed
    #[error("worker channel i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-contract message on a channel
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl FarmError {
    /// Project the error into a payload that can cross the channel.
    pub(crate) fn to_payload(&self) -> ErrorPayload {
        match self {
            FarmError::HandlerNotFound(handler) => ErrorPayload::handler_not_found(handler.clone()),
            FarmError::Protocol(message) => ErrorPayload {
                kind: ErrorKind::Protocol,
                message: message.clone(),
            },
            other => ErrorPayload::task(other.to_string()),
        }
    }

    /// Rebuild an error from a payload received over the channel.
    pub(crate) fn from_payload(payload: ErrorPayload) -> Self {
        match payload.kind {
            ErrorKind::Task => FarmError::Task(payload.message),
            ErrorKind::HandlerNotFound => FarmError::HandlerNotFound(payload.message),
            ErrorKind::Protocol => FarmError::Protocol(payload.message),
        }
    }
}
