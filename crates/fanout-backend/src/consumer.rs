//! Stream consumption shared by every transport.
//!
//! [`StreamConsumer`] is fed raw byte chunks by an adapter (HTTP body,
//! process stdout, test fixture) and turns them into progress callbacks and
//! exactly one terminal outcome.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::decode::LineDecoder;
use crate::error::CallFailure;
use crate::normalize::{normalize_line, BackendEvent};

/// Receiver of non-terminal events produced during a call.
///
/// Implemented by the orchestrator's per-task event sender; tests use an
/// in-memory collector.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called for every step/progress description.
    async fn progress(&self, message: String);

    /// Called the first time a live-view handle is seen, and again only if
    /// the handle changes.
    async fn streaming_handle(&self, url: String);
}

/// Successful terminal outcome of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSuccess {
    /// Result payload reported by the backend.
    pub result: Value,
    /// Last live-view handle seen during the call, if any.
    pub streaming_handle: Option<String>,
}

/// Sans-IO state machine turning byte chunks into events.
pub struct StreamConsumer<'a> {
    decoder: LineDecoder,
    sink: &'a dyn ProgressSink,
    last_handle: Option<String>,
    line_count: u64,
    skipped_count: u64,
}

impl<'a> StreamConsumer<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            decoder: LineDecoder::new(),
            sink,
            last_handle: None,
            line_count: 0,
            skipped_count: 0,
        }
    }

    /// Feed one chunk. Returns the terminal outcome as soon as one is
    /// decoded; the caller should stop reading at that point.
    pub async fn feed(&mut self, chunk: &[u8]) -> Option<Result<CallSuccess, CallFailure>> {
        for line in self.decoder.push(chunk) {
            if let Some(outcome) = self.handle_line(&line).await {
                return Some(outcome);
            }
        }
        None
    }

    /// Signal end of stream. Flushes a trailing unterminated line; if no
    /// terminal event was ever decoded the call fails with
    /// [`CallFailure::StreamEnded`].
    pub async fn finish(mut self) -> Result<CallSuccess, CallFailure> {
        if let Some(line) = self.decoder.finish() {
            if let Some(outcome) = self.handle_line(&line).await {
                return outcome;
            }
        }
        warn!(
            lines = self.line_count,
            skipped = self.skipped_count,
            "Backend stream ended without a terminal event"
        );
        Err(CallFailure::StreamEnded)
    }

    async fn handle_line(&mut self, line: &str) -> Option<Result<CallSuccess, CallFailure>> {
        if line.trim().is_empty() {
            return None;
        }
        self.line_count += 1;

        let events = match normalize_line(line) {
            Ok(events) => events,
            Err(e) => {
                self.skipped_count += 1;
                let preview: String = line.chars().take(200).collect();
                warn!(error = %e, preview = %preview, "Skipping malformed backend line");
                return None;
            }
        };

        for event in events {
            match event {
                BackendEvent::Progress(message) => {
                    debug!(message_len = message.len(), "Backend progress");
                    self.sink.progress(message).await;
                }
                BackendEvent::StreamingHandle(url) => {
                    if self.last_handle.as_deref() == Some(url.as_str()) {
                        continue;
                    }
                    info!(url = %url, "Backend exposed live-view handle");
                    self.last_handle = Some(url.clone());
                    self.sink.streaming_handle(url).await;
                }
                BackendEvent::Completed(result) => {
                    info!(lines = self.line_count, "Backend reported completion");
                    return Some(Ok(CallSuccess {
                        result,
                        streaming_handle: self.last_handle.take(),
                    }));
                }
                BackendEvent::Failed(message) => {
                    info!(lines = self.line_count, error = %message, "Backend reported failure");
                    return Some(Err(CallFailure::Remote(message)));
                }
            }
        }
        None
    }
}

/// Drive a byte stream to its terminal outcome.
///
/// A read error mid-stream is a network failure.
pub async fn consume_stream<S, B, E>(
    mut stream: S,
    sink: &dyn ProgressSink,
) -> Result<CallSuccess, CallFailure>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut consumer = StreamConsumer::new(sink);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CallFailure::Network(e.to_string()))?;
        if let Some(outcome) = consumer.feed(chunk.as_ref()).await {
            return outcome;
        }
    }
    consumer.finish().await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::Mutex;

    /// Collects sink callbacks in order.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn progress(&self, message: String) {
            self.events.lock().unwrap().push(format!("progress:{message}"));
        }

        async fn streaming_handle(&self, url: String) {
            self.events.lock().unwrap().push(format!("handle:{url}"));
        }
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], String>> + Unpin {
        stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_events_across_split_chunks() {
        let sink = RecordingSink::default();
        let outcome = consume_stream(
            chunks(&[
                "{\"type\":\"step\",\"message\":\"open",
                "ing\"}\n{\"liveUrl\":\"https://live/1\"}\n{\"liveUrl\":\"https://live/1\"}\n",
                "{\"type\":\"complete\",\"output\":{\"n\":3}}\n{\"type\":\"step\",\"message\":\"late\"}\n",
            ]),
            &sink,
        )
        .await
        .unwrap();

        assert_eq!(outcome.result, json!({"n": 3}));
        assert_eq!(outcome.streaming_handle.as_deref(), Some("https://live/1"));
        assert_eq!(
            *sink.events.lock().unwrap(),
            vec!["progress:opening", "handle:https://live/1"]
        );
    }

    #[tokio::test]
    async fn test_stream_end_without_terminal() {
        let sink = RecordingSink::default();
        let outcome = consume_stream(
            chunks(&["{\"type\":\"step\",\"message\":\"a\"}\n", "garbage\n"]),
            &sink,
        )
        .await;

        assert_eq!(outcome, Err(CallFailure::StreamEnded));
        assert_eq!(outcome.unwrap_err().to_string(), "stream ended without completion");
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let sink = RecordingSink::default();
        let outcome = consume_stream(
            chunks(&["not json\n{\"oops\"\n{\"type\":\"done\",\"result\":\"ok\"}"]),
            &sink,
        )
        .await
        .unwrap();

        // Terminal line without trailing newline is flushed at end of stream.
        assert_eq!(outcome.result, json!("ok"));
    }

    #[tokio::test]
    async fn test_remote_failure() {
        let sink = RecordingSink::default();
        let outcome = consume_stream(
            chunks(&["data: {\"type\":\"error\",\"message\":\"extraction failed\"}\n\n"]),
            &sink,
        )
        .await;

        assert_eq!(outcome, Err(CallFailure::Remote("extraction failed".into())));
    }

    #[tokio::test]
    async fn test_read_error_is_network_failure() {
        let sink = RecordingSink::default();
        let parts: Vec<Result<&[u8], String>> = vec![
            Ok(&b"{\"type\":\"step\",\"message\":\"a\"}\n"[..]),
            Err("connection reset by peer".to_string()),
        ];
        let outcome = consume_stream(stream::iter(parts), &sink).await;

        assert_eq!(
            outcome,
            Err(CallFailure::Network("connection reset by peer".into()))
        );
    }
}
