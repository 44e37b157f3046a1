//! Shared application state.

use std::collections::HashMap;
use std::sync::Arc;

use fanout_core::RunId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::run::{Orchestrator, RunTracker};

/// Shared application state.
pub struct AppState {
    /// Starts runs against the configured backends.
    pub orchestrator: Orchestrator,

    /// Runs started through this server, live or finished.
    pub runs: RwLock<HashMap<RunId, RunTracker>>,

    /// Envelope buffer between a run's writer and its SSE response.
    pub stream_buffer: usize,

    /// Finished runs kept in `runs`. Live runs are never evicted.
    pub max_retained_runs: usize,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(orchestrator: Orchestrator, stream_buffer: usize, max_retained_runs: usize) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            runs: RwLock::new(HashMap::new()),
            stream_buffer: stream_buffer.max(1),
            max_retained_runs,
        })
    }

    /// Start tracking a run, evicting the oldest finished runs beyond the
    /// retention limit.
    pub async fn track(&self, tracker: RunTracker) {
        let mut runs = self.runs.write().await;
        runs.insert(tracker.run_id().clone(), tracker);

        let mut finished = Vec::new();
        for (run_id, tracker) in runs.iter() {
            if let Some(at) = tracker.finished_at().await {
                finished.push((at, run_id.clone()));
            }
        }
        if finished.len() <= self.max_retained_runs {
            return;
        }
        finished.sort_by_key(|(at, _)| *at);
        let evict = finished.len() - self.max_retained_runs;
        for (_, run_id) in finished.into_iter().take(evict) {
            runs.remove(&run_id);
            debug!(run_id = %run_id, "Evicted finished run");
        }
    }

    pub async fn run(&self, run_id: &RunId) -> Option<RunTracker> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// All tracked runs.
    pub async fn trackers(&self) -> Vec<RunTracker> {
        self.runs.read().await.values().cloned().collect()
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}
