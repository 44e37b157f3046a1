//! Orchestrator configuration.

use std::collections::BTreeMap;
use std::path::Path;

use fanout_backend::BackendSpec;
use fanout_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::writer::DEFAULT_WRITE_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// HTTP server bind address.
    pub bind_addr: String,

    /// Concurrency limit used when a request does not specify one.
    pub default_concurrency: usize,

    /// Run-wide wall-clock budget used when a request does not specify one.
    pub run_timeout_ms: Option<u64>,

    /// Base retry policy; requests may override individual fields.
    pub retry_policy: RetryPolicy,

    /// Capacity of each run's event channel.
    pub event_buffer: usize,

    /// Longest a single write to a run's consumer may take before the
    /// consumer is treated as disconnected.
    pub sink_write_timeout_ms: u64,

    /// Finished runs kept for `GET /v1/runs`; the oldest are evicted first.
    pub max_retained_runs: usize,

    /// Backend registry, keyed by candidate id.
    pub backends: BTreeMap<String, BackendSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            default_concurrency: 4,
            run_timeout_ms: None,
            retry_policy: RetryPolicy::default(),
            event_buffer: 256,
            sink_write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            max_retained_runs: 100,
            backends: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_concurrency == 0 {
            return Err(ConfigError::Invalid("defaultConcurrency must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("eventBuffer must be at least 1".into()));
        }
        if self.sink_write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sinkWriteTimeoutMs must be at least 1".into()));
        }
        Ok(())
    }
}
