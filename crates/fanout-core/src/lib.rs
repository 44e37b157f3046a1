//! Fanout Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Async runtime specifics
//! - Any particular backend vocabulary
//!
//! All types here describe an orchestration run: the tasks submitted
//! together, the events they produce, and the envelopes sent to callers.

pub mod envelope;
pub mod error;
pub mod event;
pub mod ids;
pub mod model;
pub mod policy;
pub mod run;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use envelope::{Envelope, EnvelopeType};
pub use error::CoreError;
pub use event::{TaskEvent, TaskEventKind};
pub use ids::{RunId, TaskId};
pub use model::BackendCandidate;
pub use policy::{BackoffStrategy, RetryPolicy, RetryPolicyOverride};
pub use run::{OrchestrationRun, RunSummary};
pub use status::TaskStatus;
pub use task::{TaskResult, TaskUnit};
