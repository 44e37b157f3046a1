//! Orchestrator error types.

use fanout_backend::RequestError;
use fanout_core::TaskId;
use thiserror::Error;

/// A run was rejected before any task was dispatched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("concurrencyLimit must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("backendCandidates must name at least one backend")]
    NoCandidates,

    #[error("Unknown backend candidate: {0}")]
    UnknownCandidate(String),

    #[error("Backend {candidate} is unavailable: {reason}")]
    BackendUnavailable { candidate: String, reason: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Invalid input for task {task_id}: {source}")]
    InvalidTaskInput {
        task_id: TaskId,
        #[source]
        source: RequestError,
    },
}

/// The outbound sink refused a write.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The consumer went away.
    #[error("Sink closed by consumer")]
    Closed,

    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}
