//! HTTP server for the orchestrator.
//!
//! Provides endpoints for:
//! - Starting a run and streaming its envelopes over SSE (`POST /v1/runs`)
//! - Listing runs and reading partial results (`/v1/runs`, `/v1/runs/:run_id`)
//! - Cancelling a run (`POST /v1/runs/:run_id/cancel`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

pub use handlers::{ApiError, RUN_ID_HEADER};

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Browser dashboards subscribe from other origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        // API routes
        .route("/v1/runs", post(handlers::create_run).get(handlers::list_runs))
        .route("/v1/runs/:run_id", get(handlers::get_run))
        .route("/v1/runs/:run_id/cancel", post(handlers::cancel_run))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
