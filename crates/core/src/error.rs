use crate::job::JobState;
use crate::types::JobId;

/// Errors returned synchronously by the queue, registry and request
/// validation. A failed *job* is never reported through this type; it is
/// a terminal [`JobState`] with a [`JobFailure`](crate::job::JobFailure).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Queue is full ({capacity} active jobs)")]
    QueueFull { capacity: usize },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} cannot be cancelled: already {state}")]
    NotCancellable { id: JobId, state: JobState },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Engine is shutting down")]
    ShuttingDown,
}
