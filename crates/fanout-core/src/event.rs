//! Task events produced while a task is being driven.

use crate::ids::TaskId;
use crate::model::BackendCandidate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A task event. Events for one task are produced by a single controller
/// and keep the order in which they were generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task this event belongs to.
    pub task_id: TaskId,
    /// Type of event.
    pub kind: TaskEventKind,
    /// Event-specific payload.
    pub detail: Value,
    /// Unix timestamp (milliseconds) when the event occurred.
    pub timestamp_ms: i64,
}

impl TaskEvent {
    /// Create a new task event.
    pub fn new(task_id: TaskId, kind: TaskEventKind, detail: Value) -> Self {
        Self {
            task_id,
            kind,
            detail,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a Started event.
    pub fn started(task_id: TaskId, candidate: &BackendCandidate) -> Self {
        Self::new(
            task_id,
            TaskEventKind::Started,
            json!({ "backend": candidate.as_str() }),
        )
    }

    /// Create a Progress event with a human-readable message.
    pub fn progress(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::new(
            task_id,
            TaskEventKind::Progress,
            json!({ "message": message.into() }),
        )
    }

    /// Create a Progress event describing a retry or candidate switch.
    pub fn retrying(
        task_id: TaskId,
        candidate: &BackendCandidate,
        attempt: u32,
        delay_ms: u64,
        reason: &str,
    ) -> Self {
        Self::new(
            task_id,
            TaskEventKind::Progress,
            json!({
                "message": format!("retrying on {} in {}ms: {}", candidate, delay_ms, reason),
                "backend": candidate.as_str(),
                "attempt": attempt,
                "delayMs": delay_ms,
            }),
        )
    }

    /// Create a StreamingHandle event carrying a live-view URL.
    pub fn streaming_handle(task_id: TaskId, url: impl Into<String>) -> Self {
        Self::new(
            task_id,
            TaskEventKind::StreamingHandle,
            json!({ "url": url.into() }),
        )
    }

    /// Create a Completed event.
    pub fn completed(
        task_id: TaskId,
        result: Value,
        candidate: &BackendCandidate,
        attempts: u32,
    ) -> Self {
        Self::new(
            task_id,
            TaskEventKind::Completed,
            json!({
                "result": result,
                "backend": candidate.as_str(),
                "attempts": attempts,
            }),
        )
    }

    /// Create a Failed event.
    pub fn failed(task_id: TaskId, reason: impl Into<String>, attempts: u32) -> Self {
        Self::new(
            task_id,
            TaskEventKind::Failed,
            json!({ "error": reason.into(), "attempts": attempts }),
        )
    }
}

/// Type of task event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Task acquired a slot and its first attempt begins.
    Started,
    /// Step/progress description from the backend, or a retry notice.
    Progress,
    /// Live-view handle exposed mid-task.
    StreamingHandle,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
}
