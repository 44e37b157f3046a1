//! Run handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use fanout_core::{Envelope, RunId};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};

use crate::http::responses::{CancelResponse, ErrorResponse, RunDetailResponse, RunListEntry};
use crate::run::RunRequest;
use crate::state::AppState;
use crate::writer::ChannelSink;

/// Header carrying the id of a run started by `POST /v1/runs`.
pub const RUN_ID_HEADER: &str = "x-run-id";

/// API errors.
#[derive(Debug)]
pub enum ApiError {
    /// The request was rejected before dispatch; answered with a
    /// `run_error` envelope.
    InvalidRun(String),
    RunNotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidRun(message) => {
                (StatusCode::BAD_REQUEST, Json(Envelope::run_error(message))).into_response()
            }
            ApiError::RunNotFound(run_id) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("Run '{}' not found", run_id),
                }),
            )
                .into_response(),
        }
    }
}

/// Start a run and stream its envelopes as server-sent events.
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRun(e.body_text()))?;

    let (sink, rx) = ChannelSink::new(state.stream_buffer);
    let handle = state
        .orchestrator
        .start(request, Box::new(sink))
        .map_err(|e| {
            warn!(error = %e, "Rejected run request");
            ApiError::InvalidRun(e.to_string())
        })?;

    let run_id = handle.run_id().to_string();
    state.track(handle.tracker()).await;
    tokio::spawn(async move {
        handle.wait().await;
    });
    info!(run_id = %run_id, "Streaming run over SSE");

    let events = ReceiverStream::new(rx).map(|envelope| Ok::<_, Infallible>(envelope_event(&envelope)));
    let sse = Sse::new(events).keep_alive(KeepAlive::default());
    Ok(([(RUN_ID_HEADER, run_id)], sse).into_response())
}

fn envelope_event(envelope: &Envelope) -> Event {
    Event::default()
        .event(envelope.envelope_type.as_str())
        .json_data(envelope)
        .unwrap_or_else(|e| Event::default().comment(format!("encode error: {}", e)))
}

/// List tracked runs, oldest first.
pub async fn list_runs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut runs = Vec::new();
    for tracker in state.trackers().await {
        runs.push(tracker.snapshot().await);
    }
    runs.sort_by_key(|run| run.started_at);
    let response: Vec<RunListEntry> = runs.iter().map(RunListEntry::from).collect();
    Json(response)
}

/// Current state of one run, including partial results.
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetailResponse>, ApiError> {
    let tracker = state
        .run(&RunId::new(run_id.clone()))
        .await
        .ok_or(ApiError::RunNotFound(run_id))?;
    let run = tracker.snapshot().await;
    Ok(Json(RunDetailResponse::from(&run)))
}

/// Cancel a run. Finished runs are left untouched.
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let tracker = state
        .run(&RunId::new(run_id.clone()))
        .await
        .ok_or_else(|| ApiError::RunNotFound(run_id.clone()))?;

    let finished = tracker.is_finished().await;
    if !finished {
        tracker.cancel();
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            run_id,
            cancelled: !finished,
        }),
    ))
}
