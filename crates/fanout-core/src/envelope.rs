//! Outbound envelopes streamed to the caller.

use crate::{RunId, RunSummary, TaskEvent, TaskEventKind, TaskId, TaskResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Envelope types that can be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    TaskStart,
    TaskProgress,
    TaskStreamingHandle,
    TaskComplete,
    TaskError,
    RunComplete,
    RunError,
}

impl EnvelopeType {
    /// Wire name, also used as the SSE event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStart => "task_start",
            Self::TaskProgress => "task_progress",
            Self::TaskStreamingHandle => "task_streaming_handle",
            Self::TaskComplete => "task_complete",
            Self::TaskError => "task_error",
            Self::RunComplete => "run_complete",
            Self::RunError => "run_error",
        }
    }
}

impl From<TaskEventKind> for EnvelopeType {
    fn from(kind: TaskEventKind) -> Self {
        match kind {
            TaskEventKind::Started => Self::TaskStart,
            TaskEventKind::Progress => Self::TaskProgress,
            TaskEventKind::StreamingHandle => Self::TaskStreamingHandle,
            TaskEventKind::Completed => Self::TaskComplete,
            TaskEventKind::Failed => Self::TaskError,
        }
    }
}

/// A single outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create a new envelope with the current timestamp.
    pub fn new(envelope_type: EnvelopeType, task_id: Option<TaskId>, data: Option<Value>) -> Self {
        Self {
            envelope_type,
            task_id,
            data,
            timestamp: Utc::now(),
        }
    }

    /// The final envelope of every run, emitted exactly once.
    pub fn run_complete(
        run_id: &RunId,
        summary: &RunSummary,
        cancelled: bool,
        results: &[TaskResult],
    ) -> Self {
        Self::new(
            EnvelopeType::RunComplete,
            None,
            Some(json!({
                "runId": run_id.as_str(),
                "total": summary.total,
                "completed": summary.completed,
                "failed": summary.failed,
                "skipped": summary.skipped,
                "durationMs": summary.duration_ms,
                "cancelled": cancelled,
                "results": results,
            })),
        )
    }

    /// The single envelope emitted when a run is rejected before dispatch.
    pub fn run_error(message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeType::RunError,
            None,
            Some(json!({ "message": message.into() })),
        )
    }

    /// Returns true for envelopes that end the outbound stream.
    pub fn is_final(&self) -> bool {
        matches!(
            self.envelope_type,
            EnvelopeType::RunComplete | EnvelopeType::RunError
        )
    }
}

impl From<&TaskEvent> for Envelope {
    fn from(event: &TaskEvent) -> Self {
        let timestamp =
            DateTime::<Utc>::from_timestamp_millis(event.timestamp_ms).unwrap_or_else(Utc::now);
        Self {
            envelope_type: event.kind.into(),
            task_id: Some(event.task_id.clone()),
            data: Some(event.detail.clone()),
            timestamp,
        }
    }
}
