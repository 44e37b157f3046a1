//! Streaming HTTP backend adapter.

use std::time::Duration;

use async_trait::async_trait;
use fanout_core::BackendCandidate;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::adapter::{BackendAdapter, CallRequest};
use crate::classify::parse_retry_after_header;
use crate::consumer::{consume_stream, CallSuccess, ProgressSink};
use crate::error::CallFailure;

const ERROR_BODY_LIMIT: usize = 2_000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls a backend that accepts a JSON POST and answers with an NDJSON or
/// SSE body.
#[derive(Debug, Clone)]
pub struct HttpStreamAdapter {
    client: Client,
    url: String,
    api_key_env: Option<String>,
}

impl HttpStreamAdapter {
    /// Create an adapter for `url` with a default client.
    pub fn new(url: impl Into<String>) -> Result<Self, CallFailure> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("fanout/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, url))
    }

    /// Create an adapter that uses an existing client.
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key_env: None,
        }
    }

    /// Send `Authorization: Bearer $VAR` on every call.
    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn api_key(&self) -> Result<Option<String>, CallFailure> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .map_err(|_| CallFailure::Launch(format!("environment variable {} is not set", var))),
        }
    }
}

#[async_trait]
impl BackendAdapter for HttpStreamAdapter {
    fn supports(&self, _candidate: &BackendCandidate) -> bool {
        true
    }

    fn preflight(&self, _candidate: &BackendCandidate) -> Result<(), CallFailure> {
        self.api_key().map(|_| ())
    }

    async fn call(
        &self,
        candidate: &BackendCandidate,
        request: &CallRequest,
        sink: &dyn ProgressSink,
    ) -> Result<CallSuccess, CallFailure> {
        let body = json!({
            "target": request.target,
            "instruction": request.instruction,
            "config": request.config,
        });

        let mut builder = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/x-ndjson, text/event-stream")
            .json(&body);
        if let Some(key) = self.api_key()? {
            builder = builder.bearer_auth(key);
        }

        info!(candidate = %candidate, url = %self.url, "Opening backend stream");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after_header);
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > ERROR_BODY_LIMIT {
                let cut = (0..=ERROR_BODY_LIMIT)
                    .rev()
                    .find(|i| text.is_char_boundary(*i))
                    .unwrap_or(0);
                text.truncate(cut);
            }
            warn!(
                candidate = %candidate,
                status = status.as_u16(),
                retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                "Backend rejected call"
            );
            return Err(CallFailure::Status {
                status: status.as_u16(),
                body: text,
                retry_after,
            });
        }

        debug!(candidate = %candidate, status = status.as_u16(), "Backend stream open");
        consume_stream(Box::pin(response.bytes_stream()), sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::tests::RecordingSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP/1.1 response and return the received request.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/run", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (url, handle)
    }

    fn adapter(url: String) -> HttpStreamAdapter {
        let client = Client::builder().no_proxy().build().unwrap();
        HttpStreamAdapter::with_client(client, url)
    }

    #[tokio::test]
    async fn test_streams_ndjson_body() {
        let body = "{\"type\":\"step\",\"message\":\"navigating\"}\n{\"type\":\"complete\",\"result\":{\"ok\":true}}\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n{}",
            body
        );
        let (url, server) = serve_once(response).await;
        let sink = RecordingSink::default();

        let success = adapter(url)
            .call(
                &BackendCandidate::new("agent"),
                &CallRequest::new("https://shop.example", "list prices"),
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(success.result, json!({"ok": true}));
        assert_eq!(*sink.events.lock().unwrap(), vec!["progress:navigating"]);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /run"));
        assert!(request.contains("\"instruction\":\"list prices\""));
    }

    #[tokio::test]
    async fn test_rate_limited_status_carries_retry_after() {
        let response = "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Length: 9\r\nConnection: close\r\n\r\nslow down".to_string();
        let (url, _server) = serve_once(response).await;
        let sink = RecordingSink::default();

        let failure = adapter(url)
            .call(&BackendCandidate::new("agent"), &CallRequest::new("t", "i"), &sink)
            .await
            .unwrap_err();

        assert_eq!(
            failure,
            CallFailure::Status {
                status: 429,
                body: "slow down".into(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_api_key_env_is_launch_failure() {
        let candidate = BackendCandidate::new("agent");
        let adapter = adapter("http://127.0.0.1:9/run".into())
            .with_api_key_env("FANOUT_TEST_KEY_THAT_IS_NOT_SET");
        assert!(matches!(adapter.preflight(&candidate), Err(CallFailure::Launch(_))));

        let sink = RecordingSink::default();
        let failure = adapter
            .call(&candidate, &CallRequest::new("t", "i"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(failure, CallFailure::Launch(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/run", listener.local_addr().unwrap());
        drop(listener);

        let sink = RecordingSink::default();
        let failure = adapter(url)
            .call(&BackendCandidate::new("agent"), &CallRequest::new("t", "i"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(failure, CallFailure::Network(_)));
    }
}
