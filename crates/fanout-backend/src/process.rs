//! Subprocess backend adapter.
//!
//! Runs a locally installed agent CLI in one-shot mode and reads its
//! line-oriented JSON output from stdout.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use fanout_core::BackendCandidate;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::adapter::{BackendAdapter, CallRequest};
use crate::consumer::{CallSuccess, ProgressSink, StreamConsumer};
use crate::error::CallFailure;

const TARGET_PLACEHOLDER: &str = "{target}";
const INSTRUCTION_PLACEHOLDER: &str = "{instruction}";
const CONFIG_PLACEHOLDER: &str = "{config}";

/// Adapter that spawns one process per call.
///
/// Argument templates may contain `{target}`, `{instruction}` and
/// `{config}`. If no argument references `{instruction}`, the instruction
/// is appended as the final argument.
#[derive(Debug, Clone)]
pub struct ProcessAdapter {
    /// Executable name or path.
    command: String,

    /// Argument template.
    args: Vec<String>,

    /// Working directory (inherited if unset).
    working_dir: Option<PathBuf>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,
}

impl ProcessAdapter {
    /// Create an adapter for `command`. The command can be a bare name for
    /// PATH lookup or a full path.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env_vars: Vec::new(),
        }
    }

    /// Set the argument template.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Expand the argument template for one request.
    fn render_args(&self, request: &CallRequest) -> Vec<String> {
        let config = request.config.to_string();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace(TARGET_PLACEHOLDER, &request.target)
                    .replace(INSTRUCTION_PLACEHOLDER, &request.instruction)
                    .replace(CONFIG_PLACEHOLDER, &config)
            })
            .collect();
        if !self.args.iter().any(|a| a.contains(INSTRUCTION_PLACEHOLDER)) {
            args.push(request.instruction.clone());
        }
        args
    }
}

#[async_trait]
impl BackendAdapter for ProcessAdapter {
    fn supports(&self, _candidate: &BackendCandidate) -> bool {
        true
    }

    async fn call(
        &self,
        candidate: &BackendCandidate,
        request: &CallRequest,
        sink: &dyn ProgressSink,
    ) -> Result<CallSuccess, CallFailure> {
        let args = self.render_args(request);
        info!(
            candidate = %candidate,
            command = %self.command,
            instruction_len = request.instruction.len(),
            "Spawning backend process"
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping an aborted call must not leave the process running.
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        debug!("Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, command = %self.command, "Failed to spawn backend process");
            CallFailure::Launch(format!("{}: {}", self.command, e))
        })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallFailure::Protocol("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CallFailure::Protocol("Failed to get stderr".to_string()))?;

        let stderr_candidate = candidate.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            warn!(candidate = %stderr_candidate, stderr = %trimmed, "Backend stderr");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error reading backend stderr");
                        break;
                    }
                }
            }
        });

        let mut consumer = StreamConsumer::new(sink);
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|e| CallFailure::Network(format!("reading backend stdout: {}", e)))?;
            if n == 0 {
                break;
            }
            if let Some(outcome) = consumer.feed(&buf[..n]).await {
                // The terminal event is authoritative; don't wait for exit.
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Backend process already exited");
                }
                return outcome;
            }
        }

        let outcome = consumer.finish().await;
        match child.wait().await {
            Ok(status) => {
                let exit_code = status.code().unwrap_or(-1);
                info!(
                    candidate = %candidate,
                    exit_code = exit_code,
                    success = status.success(),
                    "Backend process exited"
                );
            }
            Err(e) => warn!(error = %e, "Failed to wait for backend process"),
        }
        outcome
    }
}
