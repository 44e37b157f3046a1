//! Scripted in-memory backend for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fanout_backend::{
    consume_stream, BackendAdapter, CallFailure, CallRequest, CallSuccess, ProgressSink,
};
use fanout_core::BackendCandidate;
use serde_json::{json, Value};

/// What one scripted call does.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Succeed {
        result: Value,
        progress: Vec<String>,
        handle: Option<String>,
        delay: Duration,
    },
    Fail {
        failure: CallFailure,
        delay: Duration,
    },
    /// Feed raw body chunks through the real stream consumer.
    Stream(Vec<String>),
    Hang,
    Panic,
}

impl Script {
    pub(crate) fn succeed(result: Value) -> Self {
        Self::Succeed {
            result,
            progress: Vec::new(),
            handle: None,
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn fail(failure: CallFailure) -> Self {
        Self::Fail {
            failure,
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn stream(chunks: &[&str]) -> Self {
        Self::Stream(chunks.iter().map(|c| c.to_string()).collect())
    }

    pub(crate) fn hang() -> Self {
        Self::Hang
    }

    pub(crate) fn panic() -> Self {
        Self::Panic
    }

    pub(crate) fn after(mut self, wait: Duration) -> Self {
        match &mut self {
            Self::Succeed { delay, .. } | Self::Fail { delay, .. } => *delay = wait,
            Self::Stream(_) | Self::Hang | Self::Panic => {}
        }
        self
    }

    pub(crate) fn with_progress(mut self, message: &str) -> Self {
        if let Self::Succeed { progress, .. } = &mut self {
            progress.push(message.to_string());
        }
        self
    }

    pub(crate) fn with_handle(mut self, url: &str) -> Self {
        if let Self::Succeed { handle, .. } = &mut self {
            *handle = Some(url.to_string());
        }
        self
    }
}

/// Adapter that replays scripts keyed by request target or by candidate.
///
/// Target scripts win over candidate scripts. When neither has anything
/// left, the fallback script runs, or a success echoing the candidate.
#[derive(Default)]
pub(crate) struct ScriptedAdapter {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    fallback: Mutex<Option<Script>>,
    calls: Mutex<HashMap<String, u32>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedAdapter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, key: &str, scripts: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(scripts);
    }

    pub(crate) fn set_fallback(&self, script: Script) {
        *self.fallback.lock().unwrap() = Some(script);
    }

    pub(crate) fn calls(&self, candidate: &str) -> u32 {
        self.calls.lock().unwrap().get(candidate).copied().unwrap_or(0)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_script(&self, candidate: &BackendCandidate, request: &CallRequest) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        for key in [request.target.as_str(), candidate.as_str()] {
            if let Some(script) = scripts.get_mut(key).and_then(VecDeque::pop_front) {
                return script;
            }
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Script::succeed(json!({ "candidate": candidate.as_str() })))
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn supports(&self, _candidate: &BackendCandidate) -> bool {
        true
    }

    async fn call(
        &self,
        candidate: &BackendCandidate,
        request: &CallRequest,
        sink: &dyn ProgressSink,
    ) -> Result<CallSuccess, CallFailure> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(candidate.to_string())
            .or_default() += 1;
        let script = self.next_script(candidate, request);

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        match script {
            Script::Succeed {
                result,
                progress,
                handle,
                delay,
            } => {
                tokio::time::sleep(delay).await;
                for message in progress {
                    sink.progress(message).await;
                }
                if let Some(url) = &handle {
                    sink.streaming_handle(url.clone()).await;
                }
                Ok(CallSuccess {
                    result,
                    streaming_handle: handle,
                })
            }
            Script::Fail { failure, delay } => {
                tokio::time::sleep(delay).await;
                Err(failure)
            }
            Script::Stream(chunks) => {
                let body = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
                consume_stream(body, sink).await
            }
            Script::Hang => std::future::pending().await,
            Script::Panic => panic!("scripted backend panic"),
        }
    }
}
