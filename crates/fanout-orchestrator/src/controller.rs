//! Retry/fallback controller.
//!
//! Drives one task through its ordered backend candidates:
//!
//! - success completes the task;
//! - a fatal failure fails it immediately;
//! - a transient failure retries the same candidate after backoff until
//!   its attempt budget is spent, then moves to the next candidate;
//! - a rate limit whose delay is at or below the policy threshold is waited
//!   out on the same candidate (budget permitting), while a longer delay
//!   moves to the next candidate at once.
//!
//! Every await point also watches the run's cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fanout_backend::{classify, CallFailure, CallRequest, CallSuccess, CandidateRegistry, Classification};
use fanout_core::{BackendCandidate, RetryPolicy};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::multiplexer::TaskEventTx;

/// Terminal outcome of driving one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        result: Value,
        candidate: BackendCandidate,
        attempts: u32,
    },
    Failed {
        reason: String,
        candidate: Option<BackendCandidate>,
        attempts: u32,
    },
    /// The run was cancelled while this task was in flight.
    Aborted { attempts: u32 },
}

impl TaskOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Completed { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::Aborted { attempts } => *attempts,
        }
    }
}

/// What to do after a failed attempt.
enum Next {
    Retry(Duration),
    Advance,
    Stop,
}

/// Retry/fallback state machine shared by every task of a run.
#[derive(Clone)]
pub struct RetryController {
    registry: Arc<CandidateRegistry>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(registry: Arc<CandidateRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    /// Drive `request` through `candidates` until a terminal outcome.
    pub async fn drive(
        &self,
        request: &CallRequest,
        candidates: &[BackendCandidate],
        events: &TaskEventTx,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let max_attempts = self.policy.max_attempts_per_candidate.max(1);
        let mut total_attempts = 0u32;
        let mut last_failure: Option<(String, BackendCandidate)> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let announced = if index == 0 {
                emit_unless_cancelled(cancel, events.started(candidate)).await
            } else {
                let switching = format!("switching to backend {}", candidate);
                emit_unless_cancelled(cancel, events.progress(switching)).await
            };
            if !announced {
                return TaskOutcome::Aborted { attempts: total_attempts };
            }

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                total_attempts += 1;
                debug!(
                    task_id = %events.task_id(),
                    candidate = %candidate,
                    attempt,
                    "Calling backend"
                );

                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(task_id = %events.task_id(), candidate = %candidate, "Attempt aborted by cancellation");
                        return TaskOutcome::Aborted { attempts: total_attempts };
                    }
                    result = self.attempt(candidate, request, events) => result,
                };

                let failure = match result {
                    Ok(success) => {
                        info!(
                            task_id = %events.task_id(),
                            candidate = %candidate,
                            attempts = total_attempts,
                            "Task completed"
                        );
                        return TaskOutcome::Completed {
                            result: success.result,
                            candidate: candidate.clone(),
                            attempts: total_attempts,
                        };
                    }
                    Err(failure) => failure,
                };

                let reason = failure.to_string();
                let next = self.next_step(&failure, attempt, max_attempts);
                last_failure = Some((reason.clone(), candidate.clone()));

                match next {
                    Next::Stop => {
                        info!(
                            task_id = %events.task_id(),
                            candidate = %candidate,
                            error = %reason,
                            "Task failed with non-retryable error"
                        );
                        return TaskOutcome::Failed {
                            reason,
                            candidate: Some(candidate.clone()),
                            attempts: total_attempts,
                        };
                    }
                    Next::Advance => {
                        warn!(
                            task_id = %events.task_id(),
                            candidate = %candidate,
                            attempt,
                            error = %reason,
                            "Giving up on candidate"
                        );
                        break;
                    }
                    Next::Retry(delay) => {
                        let delay_ms = delay.as_millis() as u64;
                        warn!(
                            task_id = %events.task_id(),
                            candidate = %candidate,
                            attempt,
                            delay_ms,
                            error = %reason,
                            "Retrying same candidate"
                        );
                        let notice = events.retrying(candidate, attempt, delay_ms, &reason);
                        if !emit_unless_cancelled(cancel, notice).await {
                            return TaskOutcome::Aborted { attempts: total_attempts };
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return TaskOutcome::Aborted { attempts: total_attempts };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        match last_failure {
            Some((reason, candidate)) => TaskOutcome::Failed {
                reason,
                candidate: Some(candidate),
                attempts: total_attempts,
            },
            None => TaskOutcome::Failed {
                reason: "no backend candidates".to_string(),
                candidate: None,
                attempts: 0,
            },
        }
    }

    /// One adapter invocation, bounded by the per-call timeout if set.
    async fn attempt(
        &self,
        candidate: &BackendCandidate,
        request: &CallRequest,
        events: &TaskEventTx,
    ) -> Result<CallSuccess, CallFailure> {
        let call = self.registry.call(candidate, request, events);
        match self.policy.call_timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(CallFailure::Timeout(limit))),
            None => call.await,
        }
    }

    fn next_step(&self, failure: &CallFailure, attempt: u32, max_attempts: u32) -> Next {
        let attempts_left = attempt < max_attempts;
        match classify(failure) {
            Classification::Fatal => Next::Stop,
            Classification::Transient if attempts_left => {
                Next::Retry(self.policy.transient_backoff(attempt))
            }
            Classification::Transient => Next::Advance,
            Classification::RateLimited(hint) => {
                let delay = hint.unwrap_or_else(|| self.policy.default_rate_limit_delay());
                if delay <= self.policy.same_candidate_delay_threshold() && attempts_left {
                    Next::Retry(delay)
                } else {
                    Next::Advance
                }
            }
        }
    }
}

/// Await an event emit unless the run is cancelled first. Returns false on
/// cancellation.
async fn emit_unless_cancelled(cancel: &CancellationToken, emit: impl Future<Output = ()>) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = emit => true,
    }
}
