//! Core domain errors.

use thiserror::Error;

/// Core domain errors for Fanout.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found in the run.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
