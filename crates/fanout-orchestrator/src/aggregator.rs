//! Result aggregator.
//!
//! Owns the authoritative [`OrchestrationRun`]. Statuses only move forward;
//! a late outcome for a task that was already skipped by cancellation is
//! ignored. Summaries are always recomputed from the task list.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fanout_core::{
    CoreError, OrchestrationRun, RunId, RunSummary, TaskId, TaskResult, TaskStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::controller::TaskOutcome;

/// Shared handle to one run's results.
#[derive(Clone)]
pub struct ResultAggregator {
    run: Arc<RwLock<OrchestrationRun>>,
}

impl ResultAggregator {
    pub fn new(run: OrchestrationRun) -> Self {
        Self {
            run: Arc::new(RwLock::new(run)),
        }
    }

    pub async fn run_id(&self) -> RunId {
        self.run.read().await.id.clone()
    }

    /// Move a pending task to running.
    pub async fn mark_running(&self, task_id: &TaskId) -> Result<(), CoreError> {
        let mut run = self.run.write().await;
        run.task_mut(task_id)?.start()?;
        run.recompute_summary();
        debug!(task_id = %task_id, "Task running");
        Ok(())
    }

    /// Record a controller outcome. Returns false if the task was already
    /// terminal (or the outcome was an abort) and nothing changed.
    pub async fn record(&self, task_id: &TaskId, outcome: &TaskOutcome) -> Result<bool, CoreError> {
        let mut run = self.run.write().await;
        let task = run.task_mut(task_id)?;
        if task.is_terminal() {
            debug!(task_id = %task_id, status = %task.status, "Ignoring outcome for terminal task");
            return Ok(false);
        }

        match outcome {
            TaskOutcome::Completed {
                result,
                candidate,
                attempts,
            } => task.complete(result.clone(), candidate.clone(), *attempts)?,
            TaskOutcome::Failed {
                reason,
                candidate,
                attempts,
            } => task.fail(reason.clone(), candidate.clone(), *attempts)?,
            TaskOutcome::Aborted { attempts } => {
                task.attempts = *attempts;
                return Ok(false);
            }
        }
        run.recompute_summary();
        Ok(true)
    }

    /// Fail a task that never produced an outcome (internal error or
    /// panic). Returns the attempt count recorded for it, or `None` if it
    /// was already terminal. A running task has at least its current
    /// attempt in flight.
    pub async fn record_failure(&self, task_id: &TaskId, reason: &str) -> Result<Option<u32>, CoreError> {
        let mut run = self.run.write().await;
        let task = run.task_mut(task_id)?;
        if task.is_terminal() {
            return Ok(None);
        }
        let attempts = if task.status == TaskStatus::Running {
            task.attempts.max(1)
        } else {
            task.attempts
        };
        task.fail(reason, None, attempts)?;
        run.recompute_summary();
        warn!(task_id = %task_id, reason = %reason, attempts, "Task failed internally");
        Ok(Some(attempts))
    }

    /// Force every pending or running task to skipped. Terminal tasks are
    /// untouched. Returns the number of new skipped transitions.
    pub async fn skip_unfinished(&self, reason: &str) -> usize {
        let mut run = self.run.write().await;
        let mut skipped = 0;
        for task in run.tasks.iter_mut().filter(|t| !t.is_terminal()) {
            match task.skip(reason) {
                Ok(()) => skipped += 1,
                Err(e) => warn!(task_id = %task.id, error = %e, "Could not skip task"),
            }
        }
        run.recompute_summary();
        info!(skipped, reason = %reason, "Skipped unfinished tasks");
        skipped
    }

    /// Flag the run as cancelled (explicitly or by its time budget).
    pub async fn mark_cancelled(&self) {
        self.run.write().await.cancelled = true;
    }

    /// Current per-task results, terminal or not.
    pub async fn partial_results(&self) -> Vec<TaskResult> {
        self.run.read().await.results()
    }

    pub async fn running_count(&self) -> usize {
        self.run.read().await.count(TaskStatus::Running)
    }

    /// Fresh summary over the current statuses.
    pub async fn summary(&self) -> RunSummary {
        self.run.write().await.recompute_summary().clone()
    }

    /// Copy of the whole run.
    pub async fn snapshot(&self) -> OrchestrationRun {
        let mut run = self.run.read().await.clone();
        run.recompute_summary();
        run
    }

    pub async fn is_finalized(&self) -> bool {
        self.run.read().await.completed_at.is_some()
    }

    /// When the run was finalized, if it has been.
    pub async fn finalized_at(&self) -> Option<DateTime<Utc>> {
        self.run.read().await.completed_at
    }

    /// Close the run and compute the final summary. Calling it again
    /// returns the same summary.
    pub async fn finalize(&self) -> (RunSummary, bool, Vec<TaskResult>) {
        let mut run = self.run.write().await;
        if run.completed_at.is_none() {
            run.completed_at = Some(Utc::now());
        }
        let summary = run.recompute_summary().clone();
        (summary, run.cancelled, run.results())
    }
}
