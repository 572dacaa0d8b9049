//! Error types for worker communication and lifecycle management.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur while talking to a worker or managing its lifecycle.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Failed to spawn the worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// The endpoint refused an outbound message; the context is gone.
    #[error("failed to send to worker: endpoint closed")]
    SendFailed,

    /// Failed to serialize a message.
    #[error("failed to serialize message: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Failed to deserialize a result payload.
    #[error("failed to deserialize result: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// Call timed out waiting for a response.
    #[error("call timed out after {0} seconds")]
    Timeout(u64),

    /// The call was abandoned by a cancellation signal.
    #[error("call cancelled")]
    Cancelled,

    /// The worker context reported a failure not tied to a specific call.
    #[error("worker context fault: {0}")]
    ContextFault(String),

    /// Response channel was closed (internal error).
    #[error("response channel closed unexpectedly")]
    ChannelClosed,

    /// The remote method rejected with an application error.
    #[error("worker returned an error: {0}")]
    Remote(serde_json::Value),

    /// Channel construction, including the constructor call, failed.
    #[error("worker construction failed: {0}")]
    ConstructionFailed(Arc<WorkerError>),

    /// Worker binary could not be located.
    #[error("worker binary not found; set worker.path in the configuration")]
    WorkerNotFound,
}

impl WorkerError {
    /// Check whether this rejection came from a cancellation signal rather
    /// than an application or transport failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::ConstructionFailed(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Check whether this error means the channel is unusable and must be
    /// replaced by a fresh construction.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Self::ContextFault(_) | Self::ChannelClosed | Self::SendFailed
        )
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        Self::SpawnFailed(err)
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializeFailed(err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
