//! Status enum for Task Units.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task Unit within an orchestration run.
///
/// Status is monotonic: once a task reaches a terminal state it never
/// changes again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created but not yet dispatched.
    #[default]
    Pending,
    /// Task holds a concurrency slot and its controller is driving a backend.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed (fatal error or all candidates exhausted).
    Failed,
    /// Task was never finished because the run was cancelled.
    Skipped,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if the task is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }

    /// Lowercase name used in logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
