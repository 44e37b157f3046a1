//! HTTP request handlers.

mod health;
mod runs;

pub use health::{health_check, metrics_handler};
pub use runs::{cancel_run, create_run, get_run, list_runs, ApiError, RUN_ID_HEADER};
