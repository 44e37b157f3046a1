//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use fanout_core::TaskStatus;

use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut runs = RunCounts::default();
    let mut tasks = TaskCounts::default();

    for tracker in state.trackers().await {
        let run = tracker.snapshot().await;
        match (run.completed_at.is_some(), run.cancelled) {
            (false, _) => runs.active += 1,
            (true, false) => runs.finished += 1,
            (true, true) => runs.cancelled += 1,
        }
        for task in &run.tasks {
            tasks.add(task.status);
        }
    }

    let mut output = String::new();
    write_run_metrics(&runs, &mut output);
    write_task_metrics(&tasks, &mut output);
    output
}

#[derive(Default)]
struct RunCounts {
    active: u64,
    finished: u64,
    cancelled: u64,
}

#[derive(Default)]
struct TaskCounts {
    pending: u64,
    running: u64,
    completed: u64,
    failed: u64,
    skipped: u64,
}

impl TaskCounts {
    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
        }
    }
}

fn write_run_metrics(runs: &RunCounts, output: &mut String) {
    writeln!(output, "# HELP fanout_runs Number of tracked runs by state").ok();
    writeln!(output, "# TYPE fanout_runs gauge").ok();
    writeln!(output, "fanout_runs{{state=\"active\"}} {}", runs.active).ok();
    writeln!(output, "fanout_runs{{state=\"finished\"}} {}", runs.finished).ok();
    writeln!(output, "fanout_runs{{state=\"cancelled\"}} {}", runs.cancelled).ok();
}

fn write_task_metrics(tasks: &TaskCounts, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fanout_tasks Tasks across tracked runs by status"
    )
    .ok();
    writeln!(output, "# TYPE fanout_tasks gauge").ok();
    for (status, count) in [
        ("pending", tasks.pending),
        ("running", tasks.running),
        ("completed", tasks.completed),
        ("failed", tasks.failed),
        ("skipped", tasks.skipped),
    ] {
        writeln!(output, "fanout_tasks{{status=\"{status}\"}} {count}").ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Orchestrator, RunRequest, TaskSpec};
    use crate::test_support::{Script, ScriptedAdapter};
    use crate::writer::ChannelSink;
    use fanout_backend::CandidateRegistry;
    use fanout_core::{BackendCandidate, TaskId};
    use serde_json::json;

    fn state(adapter: Arc<ScriptedAdapter>) -> Arc<AppState> {
        let registry = CandidateRegistry::new().with("primary", adapter);
        AppState::new(Orchestrator::new(Arc::new(registry)), 64, 16)
    }

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let output = collect_metrics(&state(Arc::new(ScriptedAdapter::new()))).await;

        assert!(output.contains("# TYPE fanout_runs gauge"));
        assert!(output.contains("fanout_runs{state=\"active\"} 0"));
        assert!(output.contains("fanout_tasks{status=\"pending\"} 0"));
        assert!(output.contains("fanout_tasks{status=\"skipped\"} 0"));
    }

    #[tokio::test]
    async fn test_counts_finished_run() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.script(
            "b",
            vec![Script::fail(fanout_backend::CallFailure::Remote("no prices".into()))],
        );
        let state = state(adapter);

        let request = RunRequest {
            tasks: ["a", "b"]
                .iter()
                .map(|id| TaskSpec {
                    id: TaskId::new(*id),
                    input: json!({"target": id, "instruction": "extract"}),
                })
                .collect(),
            concurrency_limit: Some(2),
            backend_candidates: vec![BackendCandidate::new("primary")],
            retry_policy: None,
            run_timeout_ms: None,
        };
        let (sink, _rx) = ChannelSink::new(64);
        let handle = state.orchestrator.start(request, Box::new(sink)).unwrap();
        state.track(handle.tracker()).await;
        handle.wait().await;

        let output = collect_metrics(&state).await;
        assert!(output.contains("fanout_runs{state=\"finished\"} 1"));
        assert!(output.contains("fanout_tasks{status=\"completed\"} 1"));
        assert!(output.contains("fanout_tasks{status=\"failed\"} 1"));
    }
}
