//! Fanout Orchestrator Library
//!
//! This crate runs batches of independent tasks against ordered backend
//! candidates with bounded concurrency, retry/fallback on rate limits and
//! transient failures, and a single ordered stream of outbound envelopes
//! per run.

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod limiter;
pub mod metrics;
pub mod multiplexer;
pub mod run;
pub mod state;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use aggregator::ResultAggregator;
pub use config::{Config, ConfigError};
pub use controller::{RetryController, TaskOutcome};
pub use error::{OrchestratorError, SinkError};
pub use limiter::{ConcurrencyLimiter, Dispatch};
pub use multiplexer::{EventMultiplexer, EventSenders, TaskEventTx};
pub use run::{Orchestrator, RunHandle, RunRequest, RunTracker, TaskSpec};
pub use state::AppState;
pub use writer::{ChannelSink, EnvelopeSink, JsonLinesSink, OutboundWriter, WriterStats};
