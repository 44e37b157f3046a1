//! Backend call adapters for Fanout
//!
//! This crate wraps single calls to external streaming backends. Each call
//! opens one connection, decodes its line-oriented stream, normalizes the
//! backend's event vocabulary, and returns exactly one terminal outcome.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fanout_backend::{CallRequest, CandidateRegistry, HttpStreamAdapter, ProgressSink};
//! use fanout_core::BackendCandidate;
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl ProgressSink for Print {
//!     async fn progress(&self, message: String) { println!("{message}"); }
//!     async fn streaming_handle(&self, url: String) { println!("live: {url}"); }
//! }
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = CandidateRegistry::new()
//!         .with("agent", Arc::new(HttpStreamAdapter::new("http://localhost:9000/run")?));
//!
//!     let request = CallRequest::new("https://shop.example", "List the prices");
//!     let success = registry
//!         .call(&BackendCandidate::new("agent"), &request, &Print)
//!         .await?;
//!
//!     println!("Result: {}", success.result);
//!     Ok(())
//! }
//! ```

mod adapter;
mod classify;
mod consumer;
mod decode;
mod error;
mod http;
mod normalize;
mod process;
pub mod repair;

pub use adapter::{BackendAdapter, BackendSpec, CallRequest, CandidateRegistry};
pub use classify::{classify, parse_retry_after_header, parse_retry_hint, Classification};
pub use consumer::{consume_stream, CallSuccess, ProgressSink, StreamConsumer};
pub use decode::LineDecoder;
pub use error::{CallFailure, RequestError};
pub use http::HttpStreamAdapter;
pub use normalize::{normalize_line, normalize_value, BackendEvent};
pub use process::ProcessAdapter;
