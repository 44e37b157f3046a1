//! The backend call adapter abstraction and the registry that routes
//! candidates to adapters.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fanout_core::BackendCandidate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::consumer::{CallSuccess, ProgressSink};
use crate::error::{CallFailure, RequestError};
use crate::http::HttpStreamAdapter;
use crate::process::ProcessAdapter;

const TARGET_KEYS: &[&str] = &["target", "url"];
const INSTRUCTION_KEYS: &[&str] = &["instruction", "prompt", "task"];

/// Everything an adapter needs to make one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRequest {
    /// What to act on (a URL, a document, a model id).
    pub target: String,
    /// What to do with it.
    pub instruction: String,
    /// Opaque per-call configuration forwarded to the backend.
    pub config: Value,
}

impl CallRequest {
    pub fn new(target: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            instruction: instruction.into(),
            config: Value::Object(Map::new()),
        }
    }

    /// Build a request from a task's input payload.
    ///
    /// Accepts `target` or `url`, and `instruction`, `prompt` or `task`.
    /// An optional `config` object is forwarded unchanged.
    pub fn from_input(input: &Value) -> Result<Self, RequestError> {
        let obj = input.as_object().ok_or(RequestError::NotAnObject)?;

        let target = first_non_empty(obj, TARGET_KEYS).ok_or(RequestError::MissingField("target"))?;
        let instruction =
            first_non_empty(obj, INSTRUCTION_KEYS).ok_or(RequestError::MissingField("instruction"))?;
        let config = obj
            .get("config")
            .filter(|c| c.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Self {
            target: target.to_string(),
            instruction: instruction.to_string(),
            config,
        })
    }
}

fn first_non_empty<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// One way of reaching a backend.
///
/// An adapter opens exactly one streaming connection per `call` and returns
/// exactly one terminal outcome. Dropping the returned future closes the
/// connection.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Whether this adapter can serve the candidate.
    fn supports(&self, candidate: &BackendCandidate) -> bool;

    /// Check, before any task is dispatched, that calls can be made at all
    /// (credentials present, command configured).
    fn preflight(&self, _candidate: &BackendCandidate) -> Result<(), CallFailure> {
        Ok(())
    }

    /// Make one call, forwarding non-terminal events to `sink`.
    async fn call(
        &self,
        candidate: &BackendCandidate,
        request: &CallRequest,
        sink: &dyn ProgressSink,
    ) -> Result<CallSuccess, CallFailure>;
}

/// How a configured backend is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    /// Streaming HTTP endpoint (NDJSON or SSE body).
    Http {
        url: String,
        /// Environment variable holding a bearer token.
        #[serde(default, rename = "apiKeyEnv", skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
    },
    /// Local command printing events to stdout.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, rename = "workingDir", skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
        /// Extra environment variables for the child process.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
}

impl BackendSpec {
    /// Build the adapter for this spec.
    pub fn build(&self) -> Result<Arc<dyn BackendAdapter>, CallFailure> {
        let adapter: Arc<dyn BackendAdapter> = match self {
            Self::Http { url, api_key_env } => {
                let mut adapter = HttpStreamAdapter::new(url.clone())?;
                if let Some(var) = api_key_env {
                    adapter = adapter.with_api_key_env(var.clone());
                }
                Arc::new(adapter)
            }
            Self::Process {
                command,
                args,
                working_dir,
                env,
            } => {
                let mut adapter = ProcessAdapter::new(command.clone()).with_args(args.clone());
                if let Some(dir) = working_dir {
                    adapter = adapter.with_working_dir(dir.clone());
                }
                for (key, value) in env {
                    adapter = adapter.with_env(key.clone(), value.clone());
                }
                Arc::new(adapter)
            }
        };
        Ok(adapter)
    }
}

/// Resolves backend candidates to adapters.
#[derive(Clone, Default)]
pub struct CandidateRegistry {
    adapters: HashMap<BackendCandidate, Arc<dyn BackendAdapter>>,
}

impl CandidateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured backend specs.
    pub fn from_specs<'a>(
        specs: impl IntoIterator<Item = (&'a String, &'a BackendSpec)>,
    ) -> Result<Self, CallFailure> {
        let mut registry = Self::new();
        for (id, spec) in specs {
            registry.register(BackendCandidate::new(id.clone()), spec.build()?);
        }
        Ok(registry)
    }

    /// Register (or replace) the adapter for a candidate.
    pub fn register(&mut self, candidate: BackendCandidate, adapter: Arc<dyn BackendAdapter>) {
        debug!(candidate = %candidate, "Registered backend adapter");
        self.adapters.insert(candidate, adapter);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, candidate: impl Into<BackendCandidate>, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.register(candidate.into(), adapter);
        self
    }

    pub fn contains(&self, candidate: &BackendCandidate) -> bool {
        self.adapters
            .get(candidate)
            .is_some_and(|adapter| adapter.supports(candidate))
    }

    /// Registered candidate ids, sorted.
    pub fn candidates(&self) -> Vec<BackendCandidate> {
        let mut ids: Vec<_> = self.adapters.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Run the candidate adapter's preflight check.
    pub fn preflight(&self, candidate: &BackendCandidate) -> Result<(), CallFailure> {
        self.adapters
            .get(candidate)
            .ok_or_else(|| CallFailure::Launch(format!("no adapter registered for '{}'", candidate)))?
            .preflight(candidate)
    }

    /// Route one call to the candidate's adapter.
    ///
    /// An unregistered candidate fails with a fatal launch error.
    pub async fn call(
        &self,
        candidate: &BackendCandidate,
        request: &CallRequest,
        sink: &dyn ProgressSink,
    ) -> Result<CallSuccess, CallFailure> {
        let adapter = self
            .adapters
            .get(candidate)
            .filter(|adapter| adapter.supports(candidate))
            .ok_or_else(|| CallFailure::Launch(format!("no adapter registered for '{}'", candidate)))?;
        adapter.call(candidate, request, sink).await
    }
}

impl std::fmt::Debug for CandidateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateRegistry")
            .field("candidates", &self.candidates())
            .finish()
    }
}
