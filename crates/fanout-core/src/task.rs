//! Task Unit type.

use crate::{BackendCandidate, CoreError, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A Task Unit is one independently schedulable unit of remote work
/// within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUnit {
    /// Caller-chosen task identifier.
    pub id: TaskId,

    /// Opaque input payload.
    pub input: Value,

    /// Current task status.
    pub status: TaskStatus,

    /// Number of adapter invocations made so far, across all candidates.
    pub attempts: u32,

    /// Backend that produced the terminal outcome.
    pub backend_used: Option<BackendCandidate>,

    /// Result payload if completed.
    pub result: Option<Value>,

    /// Failure reason if failed or skipped.
    pub error: Option<String>,

    /// When the task was dispatched.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskUnit {
    /// Create a new pending TaskUnit.
    pub fn new(id: impl Into<TaskId>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
            status: TaskStatus::Pending,
            attempts: 0,
            backend_used: None,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the task as running.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task as completed.
    pub fn complete(
        &mut self,
        result: Value,
        backend: BackendCandidate,
        attempts: u32,
    ) -> Result<(), CoreError> {
        self.transition(TaskStatus::Completed)?;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
        self.backend_used = Some(backend);
        self.attempts = attempts;
        Ok(())
    }

    /// Mark the task as failed.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        backend: Option<BackendCandidate>,
        attempts: u32,
    ) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        self.backend_used = backend;
        self.attempts = attempts;
        Ok(())
    }

    /// Mark the task as skipped.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Skipped)?;
        self.finished_at = Some(Utc::now());
        self.error = Some(reason.into());
        Ok(())
    }

    /// Snapshot of this task suitable for partial or final results.
    pub fn to_result(&self) -> TaskResult {
        TaskResult {
            task_id: self.id.clone(),
            status: self.status,
            backend: self.backend_used.clone(),
            attempts: self.attempts,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Caller-facing view of a task's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendCandidate>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
