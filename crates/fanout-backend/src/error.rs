//! Error types for backend calls.

use std::time::Duration;

use thiserror::Error;

/// Why a single backend call did not produce a result.
///
/// Every adapter returns exactly one of these or a success. The classifier
/// decides what the controller does with it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    /// Backend answered with a non-success HTTP status.
    #[error("Backend returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    /// Connection could not be opened or was reset.
    #[error("Connection error: {0}")]
    Network(String),

    /// The per-call timeout elapsed.
    #[error("Call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Backend explicitly reported failure.
    #[error("{0}")]
    Remote(String),

    /// Connection ended before any terminal event was decoded.
    #[error("stream ended without completion")]
    StreamEnded,

    /// Backend process or client could not be started.
    #[error("Failed to launch backend: {0}")]
    Launch(String),

    /// Request could not be built for this backend.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for CallFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::Protocol(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Input to a backend call could not be assembled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// Required field absent from the task input.
    #[error("Task input is missing required field '{0}'")]
    MissingField(&'static str),

    /// Task input is not a JSON object.
    #[error("Task input must be a JSON object")]
    NotAnObject,
}
