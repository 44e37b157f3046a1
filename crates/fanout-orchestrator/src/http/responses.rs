//! HTTP response types.

use fanout_core::{OrchestrationRun, RunSummary, TaskResult};
use serde::Serialize;

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// One entry of the run list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunListEntry {
    pub run_id: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub cancelled: bool,
    pub summary: RunSummary,
}

impl From<&OrchestrationRun> for RunListEntry {
    fn from(run: &OrchestrationRun) -> Self {
        Self {
            run_id: run.id.to_string(),
            started_at: run.started_at.to_rfc3339(),
            completed_at: run.completed_at.map(|t| t.to_rfc3339()),
            cancelled: run.cancelled,
            summary: run.summary.clone(),
        }
    }
}

/// A run with its per-task results as they stand.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: RunListEntry,
    pub results: Vec<TaskResult>,
}

impl From<&OrchestrationRun> for RunDetailResponse {
    fn from(run: &OrchestrationRun) -> Self {
        Self {
            run: RunListEntry::from(run),
            results: run.results(),
        }
    }
}

/// Response body for the cancel endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub run_id: String,
    /// False when the run had already finished.
    pub cancelled: bool,
}
