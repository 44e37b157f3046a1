//! Run driver.
//!
//! Validates a [`RunRequest`] and then composes the concurrency limiter,
//! retry controller, event multiplexer, result aggregator and outbound
//! writer for one run. A run that passes validation always ends with
//! exactly one `run_complete` envelope; a rejected run produces exactly one
//! `run_error` envelope when started through [`Orchestrator::execute`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fanout_backend::{CallFailure, CallRequest, CandidateRegistry};
use fanout_core::{
    BackendCandidate, Envelope, OrchestrationRun, RetryPolicy, RetryPolicyOverride, RunId,
    RunSummary, TaskId, TaskResult, TaskUnit,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::config::Config;
use crate::controller::{RetryController, TaskOutcome};
use crate::error::OrchestratorError;
use crate::limiter::ConcurrencyLimiter;
use crate::multiplexer::{EventMultiplexer, TaskEventTx};
use crate::writer::{EnvelopeSink, OutboundWriter};

const CANCELLED_REASON: &str = "run cancelled";
const TIMED_OUT_REASON: &str = "run timed out";

/// One task of a run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub input: Value,
}

/// Inbound request for one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub tasks: Vec<TaskSpec>,

    /// Falls back to the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,

    /// Ordered; the first candidate is tried first.
    pub backend_candidates: Vec<BackendCandidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicyOverride>,

    /// Run-wide wall-clock budget. Falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
}

/// A request that passed validation.
struct PreparedRun {
    run_id: RunId,
    tasks: Vec<(TaskId, CallRequest)>,
    units: Vec<TaskUnit>,
    candidates: Vec<BackendCandidate>,
    concurrency: usize,
    policy: RetryPolicy,
    run_timeout: Option<Duration>,
}

/// Starts and drives orchestration runs against a candidate registry.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<CandidateRegistry>,
    retry_policy: RetryPolicy,
    default_concurrency: usize,
    run_timeout: Option<Duration>,
    event_buffer: usize,
    sink_write_timeout: Duration,
}

impl Orchestrator {
    /// Orchestrator with default settings.
    pub fn new(registry: Arc<CandidateRegistry>) -> Self {
        Self::with_config(registry, &Config::default())
    }

    /// Orchestrator using `config` for run defaults.
    pub fn with_config(registry: Arc<CandidateRegistry>, config: &Config) -> Self {
        Self {
            registry,
            retry_policy: config.retry_policy.clone(),
            default_concurrency: config.default_concurrency.max(1),
            run_timeout: config.run_timeout_ms.map(Duration::from_millis),
            event_buffer: config.event_buffer.max(1),
            sink_write_timeout: Duration::from_millis(config.sink_write_timeout_ms.max(1)),
        }
    }

    /// Build the backend registry from `config` and wrap it.
    pub fn from_config(config: &Config) -> Result<Self, CallFailure> {
        let registry = CandidateRegistry::from_specs(&config.backends)?;
        info!(backends = registry.len(), "Backend registry loaded");
        Ok(Self::with_config(Arc::new(registry), config))
    }

    pub fn registry(&self) -> &CandidateRegistry {
        &self.registry
    }

    /// Validate `request` and start the run. Nothing is dispatched when
    /// validation fails.
    pub fn start(
        &self,
        request: RunRequest,
        sink: Box<dyn EnvelopeSink>,
    ) -> Result<RunHandle, OrchestratorError> {
        let prepared = self.prepare(&request)?;
        Ok(self.launch(prepared, sink, CancellationToken::new()))
    }

    /// Run to completion, cancelling when `cancel` fires.
    ///
    /// A rejected request writes a single `run_error` envelope to `sink`,
    /// closes it and returns the error.
    pub async fn execute(
        &self,
        request: RunRequest,
        mut sink: Box<dyn EnvelopeSink>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, OrchestratorError> {
        match self.prepare(&request) {
            Ok(prepared) => Ok(self.launch(prepared, sink, cancel.child_token()).wait().await),
            Err(e) => {
                warn!(error = %e, "Run rejected");
                if let Err(write_err) = sink.write(&Envelope::run_error(e.to_string())).await {
                    debug!(error = %write_err, "Could not deliver run_error");
                }
                if let Err(close_err) = sink.close().await {
                    debug!(error = %close_err, "Could not close sink");
                }
                Err(e)
            }
        }
    }

    fn prepare(&self, request: &RunRequest) -> Result<PreparedRun, OrchestratorError> {
        let concurrency = request
            .concurrency_limit
            .unwrap_or(self.default_concurrency);
        if concurrency == 0 {
            return Err(OrchestratorError::InvalidConcurrency(concurrency));
        }

        if request.backend_candidates.is_empty() {
            return Err(OrchestratorError::NoCandidates);
        }
        for candidate in &request.backend_candidates {
            if !self.registry.contains(candidate) {
                return Err(OrchestratorError::UnknownCandidate(candidate.to_string()));
            }
            self.registry
                .preflight(candidate)
                .map_err(|e| OrchestratorError::BackendUnavailable {
                    candidate: candidate.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let mut seen = HashSet::with_capacity(request.tasks.len());
        let mut tasks = Vec::with_capacity(request.tasks.len());
        let mut units = Vec::with_capacity(request.tasks.len());
        for task in &request.tasks {
            if !seen.insert(&task.id) {
                return Err(OrchestratorError::DuplicateTask(task.id.clone()));
            }
            let call = CallRequest::from_input(&task.input).map_err(|source| {
                OrchestratorError::InvalidTaskInput {
                    task_id: task.id.clone(),
                    source,
                }
            })?;
            tasks.push((task.id.clone(), call));
            units.push(TaskUnit::new(task.id.clone(), task.input.clone()));
        }

        let policy = match &request.retry_policy {
            Some(overrides) => self.retry_policy.merged(overrides),
            None => self.retry_policy.clone(),
        };

        Ok(PreparedRun {
            run_id: RunId::generate(),
            tasks,
            units,
            candidates: request.backend_candidates.clone(),
            concurrency,
            policy,
            run_timeout: request
                .run_timeout_ms
                .map(Duration::from_millis)
                .or(self.run_timeout),
        })
    }

    fn launch(
        &self,
        prepared: PreparedRun,
        sink: Box<dyn EnvelopeSink>,
        cancel: CancellationToken,
    ) -> RunHandle {
        let PreparedRun {
            run_id,
            tasks,
            units,
            candidates,
            concurrency,
            policy,
            run_timeout,
        } = prepared;

        info!(
            run_id = %run_id,
            tasks = tasks.len(),
            concurrency,
            candidates = ?candidates,
            "Run started"
        );

        let aggregator = ResultAggregator::new(OrchestrationRun::new(run_id.clone(), units));
        let driver = RunDriver {
            run_id: run_id.clone(),
            tasks,
            candidates: Arc::new(candidates),
            concurrency,
            run_timeout,
            event_buffer: self.event_buffer,
            controller: RetryController::new(self.registry.clone(), policy),
            aggregator: aggregator.clone(),
            writer: OutboundWriter::spawn(sink, self.sink_write_timeout),
            cancel: cancel.clone(),
        };

        RunHandle {
            tracker: RunTracker {
                run_id,
                cancel,
                aggregator,
            },
            join: tokio::spawn(driver.run()),
        }
    }
}

/// Cloneable view of a live or finished run.
#[derive(Clone)]
pub struct RunTracker {
    run_id: RunId,
    cancel: CancellationToken,
    aggregator: ResultAggregator,
}

impl RunTracker {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(run_id = %self.run_id, "Run cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Per-task results as they stand now.
    pub async fn partial_results(&self) -> Vec<TaskResult> {
        self.aggregator.partial_results().await
    }

    pub async fn summary(&self) -> RunSummary {
        self.aggregator.summary().await
    }

    pub async fn running_count(&self) -> usize {
        self.aggregator.running_count().await
    }

    /// Whether the final summary has been computed.
    pub async fn is_finished(&self) -> bool {
        self.aggregator.is_finalized().await
    }

    pub async fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.aggregator.finalized_at().await
    }

    pub async fn snapshot(&self) -> OrchestrationRun {
        self.aggregator.snapshot().await
    }
}

/// Owner's handle to a started run.
pub struct RunHandle {
    tracker: RunTracker,
    join: JoinHandle<RunSummary>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        self.tracker.run_id()
    }

    pub fn cancel(&self) {
        self.tracker.cancel();
    }

    pub async fn partial_results(&self) -> Vec<TaskResult> {
        self.tracker.partial_results().await
    }

    /// A tracker that stays valid after the handle is consumed.
    pub fn tracker(&self) -> RunTracker {
        self.tracker.clone()
    }

    /// Wait for the run to finish and return its final summary.
    pub async fn wait(self) -> RunSummary {
        match self.join.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(run_id = %self.tracker.run_id, error = %e, "Run driver did not finish cleanly");
                self.tracker.aggregator.finalize().await.0
            }
        }
    }
}

struct RunDriver {
    run_id: RunId,
    tasks: Vec<(TaskId, CallRequest)>,
    candidates: Arc<Vec<BackendCandidate>>,
    concurrency: usize,
    run_timeout: Option<Duration>,
    event_buffer: usize,
    controller: RetryController,
    aggregator: ResultAggregator,
    writer: OutboundWriter,
    cancel: CancellationToken,
}

impl RunDriver {
    async fn run(self) -> RunSummary {
        let Self {
            run_id,
            tasks,
            candidates,
            concurrency,
            run_timeout,
            event_buffer,
            controller,
            aggregator,
            writer,
            cancel,
        } = self;

        let mux = EventMultiplexer::start(writer.clone(), event_buffer);
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = run_timeout
            .map(|limit| spawn_watchdog(run_id.clone(), limit, cancel.clone(), timed_out.clone()));

        let senders = mux.senders();
        let panic_senders = mux.senders();
        let panic_aggregator = aggregator.clone();
        let limiter = ConcurrencyLimiter::new(concurrency);

        let dispatch = limiter
            .run(
                tasks,
                &cancel,
                |(task_id, request): (TaskId, CallRequest)| {
                    let events = senders.task(task_id.clone());
                    let controller = controller.clone();
                    let aggregator = aggregator.clone();
                    let candidates = candidates.clone();
                    let cancel = cancel.clone();
                    async move {
                        run_task(
                            &task_id,
                            &request,
                            &candidates,
                            &controller,
                            &aggregator,
                            &events,
                            &cancel,
                        )
                        .await;
                    }
                },
                move |(task_id, _): (TaskId, CallRequest), message: String| {
                    let events = panic_senders.task(task_id.clone());
                    let aggregator = panic_aggregator.clone();
                    async move {
                        let reason = format!("task panicked: {}", message);
                        match aggregator.record_failure(&task_id, &reason).await {
                            Ok(Some(attempts)) => events.failed(reason, attempts).await,
                            Ok(None) => {}
                            Err(e) => error!(task_id = %task_id, error = %e, "Failed to record panic"),
                        }
                    }
                },
            )
            .await;
        drop(senders);

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if !dispatch.undispatched.is_empty() {
            debug!(
                run_id = %run_id,
                undispatched = dispatch.undispatched.len(),
                "Tasks left undispatched"
            );
        }

        if cancel.is_cancelled() {
            let reason = if timed_out.load(Ordering::SeqCst) {
                TIMED_OUT_REASON
            } else {
                CANCELLED_REASON
            };
            aggregator.mark_cancelled().await;
            aggregator.skip_unfinished(reason).await;
        } else if aggregator.summary().await.unfinished() > 0 {
            warn!(run_id = %run_id, "Tasks ended without a terminal state");
            aggregator
                .skip_unfinished("task did not reach a terminal state")
                .await;
        }

        let forwarded = mux.shutdown().await;
        let (summary, cancelled, results) = aggregator.finalize().await;
        writer.send(Envelope::run_complete(&run_id, &summary, cancelled, &results));
        let stats = writer.close().await;

        info!(
            run_id = %run_id,
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            cancelled,
            events = forwarded,
            dropped = stats.dropped,
            "Run complete"
        );
        summary
    }
}

async fn run_task(
    task_id: &TaskId,
    request: &CallRequest,
    candidates: &[BackendCandidate],
    controller: &RetryController,
    aggregator: &ResultAggregator,
    events: &TaskEventTx,
    cancel: &CancellationToken,
) {
    // Slot granted after cancellation; leave it pending for the skip pass.
    if cancel.is_cancelled() {
        return;
    }
    if let Err(e) = aggregator.mark_running(task_id).await {
        error!(task_id = %task_id, error = %e, "Could not start task");
        return;
    }

    let outcome = controller.drive(request, candidates, events, cancel).await;
    match aggregator.record(task_id, &outcome).await {
        Ok(true) => match outcome {
            TaskOutcome::Completed {
                result,
                candidate,
                attempts,
            } => events.completed(result, &candidate, attempts).await,
            TaskOutcome::Failed {
                reason, attempts, ..
            } => events.failed(reason, attempts).await,
            TaskOutcome::Aborted { .. } => {}
        },
        Ok(false) => debug!(task_id = %task_id, "Outcome superseded"),
        Err(e) => error!(task_id = %task_id, error = %e, "Failed to record outcome"),
    }
}

fn spawn_watchdog(
    run_id: RunId,
    limit: Duration,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(limit) => {
                warn!(
                    run_id = %run_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Run exceeded its time budget, cancelling"
                );
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Script, ScriptedAdapter};
    use crate::writer::ChannelSink;
    use fanout_backend::HttpStreamAdapter;
    use fanout_core::{EnvelopeType, TaskStatus};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn orchestrator(adapter: &Arc<ScriptedAdapter>, candidates: &[&str]) -> Orchestrator {
        let mut registry = CandidateRegistry::new();
        for candidate in candidates {
            registry.register(BackendCandidate::new(*candidate), adapter.clone());
        }
        Orchestrator::new(Arc::new(registry))
    }

    fn request(n: usize, candidates: &[&str], concurrency: usize) -> RunRequest {
        RunRequest {
            tasks: (0..n)
                .map(|i| TaskSpec {
                    id: TaskId::new(format!("t{}", i)),
                    input: json!({"target": format!("site-{}", i), "instruction": "extract prices"}),
                })
                .collect(),
            concurrency_limit: Some(concurrency),
            backend_candidates: candidates.iter().map(|c| BackendCandidate::new(*c)).collect(),
            retry_policy: None,
            run_timeout_ms: None,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Some(envelope) = rx.recv().await {
            envelopes.push(envelope);
        }
        envelopes
    }

    fn run_complete(envelopes: &[Envelope]) -> &Value {
        let last = envelopes.last().unwrap();
        assert_eq!(last.envelope_type, EnvelopeType::RunComplete);
        assert_eq!(envelopes.iter().filter(|e| e.is_final()).count(), 1);
        last.data.as_ref().unwrap()
    }

    fn per_task(envelopes: &[Envelope]) -> HashMap<String, Vec<EnvelopeType>> {
        let mut sequences: HashMap<String, Vec<EnvelopeType>> = HashMap::new();
        for envelope in envelopes {
            if let Some(task_id) = &envelope.task_id {
                sequences
                    .entry(task_id.to_string())
                    .or_default()
                    .push(envelope.envelope_type);
            }
        }
        sequences
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_tasks_two_slots_all_complete() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.set_fallback(Script::succeed(json!("done")).after(Duration::from_millis(100)));
        let (sink, rx) = ChannelSink::new(1024);

        let handle = orchestrator(&adapter, &["primary"])
            .start(request(5, &["primary"], 2), Box::new(sink))
            .unwrap();

        let tracker = handle.tracker();
        let sampler = tokio::spawn(async move {
            let mut max_running = 0;
            while !tracker.is_finished().await {
                max_running = max_running.max(tracker.running_count().await);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            max_running
        });

        let summary = handle.wait().await;
        assert_eq!(
            (summary.total, summary.completed, summary.failed, summary.skipped),
            (5, 5, 0, 0)
        );
        let max_running = sampler.await.unwrap();
        assert!(max_running <= 2, "sampled {} running", max_running);
        assert_eq!(adapter.peak(), 2);

        let envelopes = drain(rx).await;
        let data = run_complete(&envelopes);
        assert_eq!(data["completed"], 5);
        assert_eq!(data["failed"], 0);
        assert_eq!(data["skipped"], 0);
        assert_eq!(data["cancelled"], false);
        assert_eq!(
            envelopes
                .iter()
                .filter(|e| e.envelope_type == EnvelopeType::TaskComplete)
                .count(),
            5
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_skips_running_and_pending() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.script("site-0", vec![Script::succeed(json!("early"))]);
        adapter.set_fallback(Script::hang());
        let (sink, rx) = ChannelSink::new(1024);

        let handle = orchestrator(&adapter, &["primary"])
            .start(request(5, &["primary"], 2), Box::new(sink))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let partial = handle.partial_results().await;
        assert_eq!(partial[0].status, TaskStatus::Completed);
        let running = partial
            .iter()
            .filter(|r| r.status == TaskStatus::Running)
            .count();
        let pending = partial
            .iter()
            .filter(|r| r.status == TaskStatus::Pending)
            .count();
        assert_eq!((running, pending), (2, 2));

        handle.cancel();
        let summary = handle.wait().await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, running + pending);

        let envelopes = drain(rx).await;
        let data = run_complete(&envelopes);
        assert_eq!(data["cancelled"], true);
        assert_eq!(data["results"][0]["status"], "completed");
        assert_eq!(data["results"][1]["status"], "skipped");
        assert_eq!(data["results"][1]["error"], CANCELLED_REASON);
        assert!(!envelopes
            .iter()
            .any(|e| e.envelope_type == EnvelopeType::TaskError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_without_terminal_event_fails_task_only() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.script(
            "site-0",
            vec![Script::stream(&[
                "{\"type\":\"step\",\"message\":\"opened page\"}\n",
                "{\"type\":\"step\",\"mess",
            ])],
        );
        let (sink, rx) = ChannelSink::new(1024);

        let mut req = request(2, &["primary"], 2);
        req.retry_policy = Some(RetryPolicyOverride {
            max_attempts_per_candidate: Some(1),
            ..Default::default()
        });
        let summary = orchestrator(&adapter, &["primary"])
            .start(req, Box::new(sink))
            .unwrap()
            .wait()
            .await;

        assert_eq!((summary.completed, summary.failed), (1, 1));
        let envelopes = drain(rx).await;
        let data = run_complete(&envelopes);
        assert_eq!(data["results"][0]["status"], "failed");
        assert_eq!(data["results"][0]["error"], "stream ended without completion");
        assert_eq!(
            per_task(&envelopes)["t0"],
            vec![
                EnvelopeType::TaskStart,
                EnvelopeType::TaskProgress,
                EnvelopeType::TaskError
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_task_event_order_end_to_end() {
        let adapter = Arc::new(ScriptedAdapter::new());
        for i in 0..4u64 {
            adapter.script(
                &format!("site-{}", i),
                vec![Script::succeed(json!(i))
                    .after(Duration::from_millis(10 * (4 - i)))
                    .with_progress("E1")
                    .with_handle(&format!("https://live.example/{}", i))],
            );
        }
        let (sink, rx) = ChannelSink::new(1024);

        orchestrator(&adapter, &["primary"])
            .start(request(4, &["primary"], 4), Box::new(sink))
            .unwrap()
            .wait()
            .await;

        let envelopes = drain(rx).await;
        let sequences = per_task(&envelopes);
        assert_eq!(sequences.len(), 4);
        for sequence in sequences.values() {
            assert_eq!(
                *sequence,
                vec![
                    EnvelopeType::TaskStart,
                    EnvelopeType::TaskProgress,
                    EnvelopeType::TaskStreamingHandle,
                    EnvelopeType::TaskComplete
                ]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_disconnect_mid_run() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.set_fallback(Script::succeed(json!("done")).after(Duration::from_millis(50)));
        let (sink, mut rx) = ChannelSink::new(1);

        let handle = orchestrator(&adapter, &["primary"])
            .start(request(3, &["primary"], 1), Box::new(sink))
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.envelope_type, EnvelopeType::TaskStart);
        drop(rx);

        let summary = handle.wait().await;
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.unfinished(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_does_not_block_the_run() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let lines: Vec<String> = (0..10)
            .map(|n| format!("{{\"type\":\"step\",\"message\":\"step {}\"}}\n", n))
            .collect();
        let chunks: Vec<&str> = lines.iter().map(String::as_str).collect();
        adapter.set_fallback(Script::stream(&chunks));
        let mut registry = CandidateRegistry::new();
        registry.register(BackendCandidate::new("primary"), adapter.clone());
        let config = Config {
            event_buffer: 1,
            sink_write_timeout_ms: 2_000,
            ..Config::default()
        };
        // Receiver stays connected but is never read.
        let (sink, _rx) = ChannelSink::new(1);

        let handle = Orchestrator::with_config(Arc::new(registry), &config)
            .start(request(2, &["primary"], 2), Box::new(sink))
            .unwrap();
        let tracker = handle.tracker();

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(60), handle.wait())
            .await
            .unwrap();

        assert_eq!(summary.unfinished(), 0);
        assert!(tracker.is_finished().await);
        assert_eq!(tracker.running_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_is_isolated() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.script("site-1", vec![Script::panic()]);
        let (sink, rx) = ChannelSink::new(1024);

        let summary = orchestrator(&adapter, &["primary"])
            .start(request(3, &["primary"], 2), Box::new(sink))
            .unwrap()
            .wait()
            .await;

        assert_eq!((summary.completed, summary.failed), (2, 1));
        let envelopes = drain(rx).await;
        let data = run_complete(&envelopes);
        assert!(data["results"][1]["error"]
            .as_str()
            .unwrap()
            .starts_with("task panicked"));
        assert_eq!(data["results"][1]["attempts"], 1);
        let failed = envelopes
            .iter()
            .find(|e| {
                e.envelope_type == EnvelopeType::TaskError
                    && e.task_id.as_ref().map(|t| t.as_str()) == Some("t1")
            })
            .unwrap();
        assert_eq!(failed.data.as_ref().unwrap()["attempts"], 1);
        assert_eq!(
            per_task(&envelopes)["t1"].last(),
            Some(&EnvelopeType::TaskError)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_across_candidates() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.script(
            "primary",
            vec![Script::fail(CallFailure::Status {
                status: 429,
                body: "rate limit".into(),
                retry_after: Some(Duration::from_secs(60)),
            })],
        );
        let (sink, rx) = ChannelSink::new(1024);

        let summary = orchestrator(&adapter, &["primary", "secondary"])
            .start(request(1, &["primary", "secondary"], 1), Box::new(sink))
            .unwrap()
            .wait()
            .await;

        assert_eq!(summary.completed, 1);
        assert_eq!(adapter.calls("primary"), 1);
        assert_eq!(adapter.calls("secondary"), 1);

        let envelopes = drain(rx).await;
        let data = run_complete(&envelopes);
        assert_eq!(data["results"][0]["backend"], "secondary");
        assert_eq!(data["results"][0]["attempts"], 2);
        assert!(envelopes.iter().any(|e| {
            e.envelope_type == EnvelopeType::TaskProgress
                && e.data.as_ref().unwrap().to_string().contains("switching to backend secondary")
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_cancels_run() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.set_fallback(Script::hang());
        let (sink, rx) = ChannelSink::new(1024);

        let mut req = request(3, &["primary"], 2);
        req.run_timeout_ms = Some(5_000);
        let summary = orchestrator(&adapter, &["primary"])
            .start(req, Box::new(sink))
            .unwrap()
            .wait()
            .await;

        assert_eq!(summary.skipped, 3);
        let envelopes = drain(rx).await;
        let data = run_complete(&envelopes);
        assert_eq!(data["cancelled"], true);
        assert_eq!(data["results"][2]["error"], TIMED_OUT_REASON);
    }

    #[tokio::test]
    async fn test_empty_run_still_completes() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let (sink, rx) = ChannelSink::new(8);

        let summary = orchestrator(&adapter, &["primary"])
            .start(request(0, &["primary"], 1), Box::new(sink))
            .unwrap()
            .wait()
            .await;

        assert_eq!(summary.total, 0);
        let envelopes = drain(rx).await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(run_complete(&envelopes)["total"], 0);
    }

    #[tokio::test]
    async fn test_configuration_errors_reject_before_dispatch() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let orch = orchestrator(&adapter, &["primary"]);

        let start = |req: RunRequest| {
            let (sink, _rx) = ChannelSink::new(8);
            orch.start(req, Box::new(sink)).err()
        };

        assert_eq!(
            start(request(1, &["primary"], 0)),
            Some(OrchestratorError::InvalidConcurrency(0))
        );
        assert_eq!(start(request(1, &[], 1)), Some(OrchestratorError::NoCandidates));
        assert_eq!(
            start(request(1, &["primary", "ghost"], 1)),
            Some(OrchestratorError::UnknownCandidate("ghost".into()))
        );

        let mut duplicate = request(2, &["primary"], 1);
        duplicate.tasks[1].id = TaskId::new("t0");
        assert_eq!(
            start(duplicate),
            Some(OrchestratorError::DuplicateTask(TaskId::new("t0")))
        );

        let mut missing = request(1, &["primary"], 1);
        missing.tasks[0].input = json!({"target": "site-0"});
        assert!(matches!(
            start(missing),
            Some(OrchestratorError::InvalidTaskInput { .. })
        ));

        assert_eq!(adapter.calls("primary"), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_rejects_run() {
        let http = HttpStreamAdapter::new("http://127.0.0.1:9/run")
            .unwrap()
            .with_api_key_env("FANOUT_RUN_TEST_KEY_THAT_IS_NOT_SET");
        let orch = Orchestrator::new(Arc::new(
            CandidateRegistry::new().with("hosted", Arc::new(http)),
        ));
        let (sink, _rx) = ChannelSink::new(8);

        let err = orch
            .start(request(1, &["hosted"], 1), Box::new(sink))
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_execute_emits_single_run_error() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let (sink, rx) = ChannelSink::new(8);

        let err = orchestrator(&adapter, &["primary"])
            .execute(
                request(2, &["nope"], 1),
                Box::new(sink),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err, OrchestratorError::UnknownCandidate("nope".into()));
        let envelopes = drain(rx).await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].envelope_type, EnvelopeType::RunError);
        assert!(envelopes[0].data.as_ref().unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_cancelled_by_parent_token() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.set_fallback(Script::hang());
        let (sink, rx) = ChannelSink::new(64);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let summary = orchestrator(&adapter, &["primary"])
            .execute(request(2, &["primary"], 2), Box::new(sink), &cancel)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(run_complete(&drain(rx).await)["cancelled"], true);
    }

    #[test]
    fn test_request_deserialize() {
        let request: RunRequest = serde_json::from_value(json!({
            "tasks": [{"id": "a", "input": {"url": "https://shop.example", "prompt": "prices"}}],
            "backendCandidates": ["primary", "secondary"],
            "retryPolicy": {"maxAttemptsPerCandidate": 1}
        }))
        .unwrap();

        assert_eq!(request.tasks[0].id, TaskId::new("a"));
        assert_eq!(request.concurrency_limit, None);
        assert_eq!(request.backend_candidates.len(), 2);
        assert_eq!(
            request.retry_policy.unwrap().max_attempts_per_candidate,
            Some(1)
        );
    }
}
