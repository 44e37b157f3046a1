//! Event multiplexer.
//!
//! Every task of a run gets a [`TaskEventTx`] feeding one shared channel.
//! A task's events are sent from its own future, one await at a time, so
//! they reach the channel in generation order. Events of different tasks
//! interleave in arrival order.

use async_trait::async_trait;
use fanout_backend::ProgressSink;
use fanout_core::{BackendCandidate, Envelope, TaskEvent, TaskId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::writer::OutboundWriter;

/// Per-task event sender.
#[derive(Clone)]
pub struct TaskEventTx {
    task_id: TaskId,
    tx: mpsc::Sender<TaskEvent>,
}

impl TaskEventTx {
    pub fn new(task_id: TaskId, tx: mpsc::Sender<TaskEvent>) -> Self {
        Self { task_id, tx }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Send an event. A closed multiplexer drops it.
    pub async fn emit(&self, event: TaskEvent) {
        if self.tx.send(event).await.is_err() {
            debug!(task_id = %self.task_id, "Multiplexer closed, dropping event");
        }
    }

    pub async fn started(&self, candidate: &BackendCandidate) {
        self.emit(TaskEvent::started(self.task_id.clone(), candidate))
            .await;
    }

    pub async fn progress(&self, message: impl Into<String>) {
        self.emit(TaskEvent::progress(self.task_id.clone(), message))
            .await;
    }

    pub async fn retrying(&self, candidate: &BackendCandidate, attempt: u32, delay_ms: u64, reason: &str) {
        self.emit(TaskEvent::retrying(
            self.task_id.clone(),
            candidate,
            attempt,
            delay_ms,
            reason,
        ))
        .await;
    }

    pub async fn completed(&self, result: Value, candidate: &BackendCandidate, attempts: u32) {
        self.emit(TaskEvent::completed(
            self.task_id.clone(),
            result,
            candidate,
            attempts,
        ))
        .await;
    }

    pub async fn failed(&self, reason: impl Into<String>, attempts: u32) {
        self.emit(TaskEvent::failed(self.task_id.clone(), reason, attempts))
            .await;
    }
}

#[async_trait]
impl ProgressSink for TaskEventTx {
    async fn progress(&self, message: String) {
        self.emit(TaskEvent::progress(self.task_id.clone(), message))
            .await;
    }

    async fn streaming_handle(&self, url: String) {
        self.emit(TaskEvent::streaming_handle(self.task_id.clone(), url))
            .await;
    }
}

/// Cloneable factory for [`TaskEventTx`] handles.
#[derive(Clone)]
pub struct EventSenders {
    tx: mpsc::Sender<TaskEvent>,
}

impl EventSenders {
    pub fn task(&self, task_id: TaskId) -> TaskEventTx {
        TaskEventTx::new(task_id, self.tx.clone())
    }
}

/// Merges task events into the outbound writer.
pub struct EventMultiplexer {
    tx: mpsc::Sender<TaskEvent>,
    forwarder: JoinHandle<u64>,
}

impl EventMultiplexer {
    /// Start the forwarding loop into `writer`.
    pub fn start(writer: OutboundWriter, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let forwarder = tokio::spawn(forward(rx, writer));
        Self { tx, forwarder }
    }

    /// Sender for one task's events.
    pub fn task_sender(&self, task_id: TaskId) -> TaskEventTx {
        TaskEventTx::new(task_id, self.tx.clone())
    }

    /// A factory that can outlive borrows of the multiplexer.
    pub fn senders(&self) -> EventSenders {
        EventSenders {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting events and wait until everything queued has been
    /// handed to the writer. Returns the number of events forwarded.
    ///
    /// Every [`TaskEventTx`] and [`EventSenders`] must have been dropped
    /// first.
    pub async fn shutdown(self) -> u64 {
        drop(self.tx);
        self.forwarder.await.unwrap_or(0)
    }
}

async fn forward(mut rx: mpsc::Receiver<TaskEvent>, writer: OutboundWriter) -> u64 {
    let mut forwarded = 0u64;
    while let Some(event) = rx.recv().await {
        trace!(task_id = %event.task_id, kind = ?event.kind, "Forwarding task event");
        writer.send(Envelope::from(&event));
        forwarded += 1;
    }
    forwarded
}
