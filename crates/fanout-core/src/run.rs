//! Orchestration run and its summary.

use crate::{CoreError, RunId, TaskId, TaskResult, TaskStatus, TaskUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The bounded-lifetime container coordinating all Task Units submitted
/// together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRun {
    /// Unique run identifier.
    pub id: RunId,

    /// Fixed task list, in submission order.
    pub tasks: Vec<TaskUnit>,

    /// When the run was created.
    pub started_at: DateTime<Utc>,

    /// When the run was finalized.
    pub completed_at: Option<DateTime<Utc>>,

    /// Whether cancellation was requested (explicitly or by timeout).
    pub cancelled: bool,

    /// Last computed summary.
    pub summary: RunSummary,
}

impl OrchestrationRun {
    /// Create a new run with all tasks pending.
    pub fn new(id: RunId, tasks: Vec<TaskUnit>) -> Self {
        let mut run = Self {
            id,
            tasks,
            started_at: Utc::now(),
            completed_at: None,
            cancelled: false,
            summary: RunSummary::default(),
        };
        run.recompute_summary();
        run
    }

    /// Find a task by id.
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskUnit> {
        self.tasks.iter().find(|t| &t.id == task_id)
    }

    /// Find a task by id for mutation.
    pub fn task_mut(&mut self, task_id: &TaskId) -> Result<&mut TaskUnit, CoreError> {
        self.tasks
            .iter_mut()
            .find(|t| &t.id == task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    /// Number of tasks currently in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Returns true once every task is terminal.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(TaskUnit::is_terminal)
    }

    /// Recompute the summary from the current task statuses.
    ///
    /// The summary is never patched incrementally.
    pub fn recompute_summary(&mut self) -> &RunSummary {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        self.summary = RunSummary {
            total: self.tasks.len(),
            completed: self.count(TaskStatus::Completed),
            failed: self.count(TaskStatus::Failed),
            skipped: self.count(TaskStatus::Skipped),
            duration_ms: (end - self.started_at).num_milliseconds().max(0) as u64,
        };
        &self.summary
    }

    /// Per-task results in submission order.
    pub fn results(&self) -> Vec<TaskResult> {
        self.tasks.iter().map(TaskUnit::to_result).collect()
    }
}

/// Run-level counts over the terminal set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Tasks not yet terminal.
    pub fn unfinished(&self) -> usize {
        self.total - self.completed - self.failed - self.skipped
    }
}
