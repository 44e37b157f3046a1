//! Outbound stream writer.
//!
//! One actor task owns the sink. Producers hand envelopes to the actor over
//! an unbounded queue, so only one write is ever in flight and no producer
//! ever waits on the consumer. A sink write that does not finish within the
//! write timeout counts as a disconnect. After the sink is closed, by the run
//! or by a disconnected or stalled consumer, further envelopes are dropped
//! without surfacing an error to any producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fanout_core::Envelope;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::SinkError;

/// Destination for serialized envelopes.
#[async_trait]
pub trait EnvelopeSink: Send {
    /// Write one envelope.
    async fn write(&mut self, envelope: &Envelope) -> Result<(), SinkError>;

    /// Flush and release the sink. Called at most once.
    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Sink backed by an mpsc channel. A dropped receiver means the consumer
/// disconnected.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Envelope>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn write(&mut self, envelope: &Envelope) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;
        tx.send(envelope.clone()).await.map_err(|_| SinkError::Closed)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        // Dropping the sender ends the receiver's stream.
        self.tx.take();
        Ok(())
    }
}

/// Sink writing one JSON envelope per line.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EnvelopeSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, envelope: &Envelope) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');
        self.writer.write_all(&line).await.map_err(io_to_sink)?;
        self.writer.flush().await.map_err(io_to_sink)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await.map_err(io_to_sink)
    }
}

fn io_to_sink(e: std::io::Error) -> SinkError {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        SinkError::Closed
    } else {
        SinkError::Io(e)
    }
}

/// Counters reported when the writer is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Envelopes the sink accepted.
    pub written: u64,
    /// Envelopes discarded because the sink was already closed.
    pub dropped: u64,
}

/// Default bound on a single sink write or close.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

enum WriterCommand {
    Write(Envelope),
    Close(oneshot::Sender<WriterStats>),
}

/// Handle to the writer actor. Cloning shares the same sink.
#[derive(Clone)]
pub struct OutboundWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    closed: Arc<AtomicBool>,
}

impl OutboundWriter {
    /// Spawn the actor that owns `sink`. A write or close taking longer
    /// than `write_timeout` closes the sink.
    pub fn spawn(sink: Box<dyn EnvelopeSink>, write_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_writer(sink, rx, closed.clone(), write_timeout));
        Self { tx, closed }
    }

    /// Queue an envelope without waiting. Never fails; envelopes sent after
    /// close are dropped.
    pub fn send(&self, envelope: Envelope) {
        if self.tx.send(WriterCommand::Write(envelope)).is_err() {
            debug!("Writer actor gone, dropping envelope");
        }
    }

    /// Close the sink and wait for the actor to acknowledge. Idempotent:
    /// later calls return the same counters without touching the sink.
    pub async fn close(&self) -> WriterStats {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Close(ack_tx)).is_err() {
            return WriterStats::default();
        }
        ack_rx.await.unwrap_or_default()
    }

    /// True once the sink has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn run_writer(
    mut sink: Box<dyn EnvelopeSink>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    closed: Arc<AtomicBool>,
    write_timeout: Duration,
) {
    let mut stats = WriterStats::default();
    let mut sink_closed = false;

    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Write(envelope) => {
                if closed.load(Ordering::SeqCst) {
                    stats.dropped += 1;
                    continue;
                }
                match tokio::time::timeout(write_timeout, sink.write(&envelope)).await {
                    Ok(Ok(())) => stats.written += 1,
                    Ok(Err(e)) => {
                        warn!(
                            error = %e,
                            envelope_type = envelope.envelope_type.as_str(),
                            "Outbound sink failed, treating consumer as disconnected"
                        );
                        closed.store(true, Ordering::SeqCst);
                        stats.dropped += 1;
                    }
                    Err(_) => {
                        warn!(
                            timeout_ms = write_timeout.as_millis() as u64,
                            envelope_type = envelope.envelope_type.as_str(),
                            "Outbound sink stalled, treating consumer as disconnected"
                        );
                        closed.store(true, Ordering::SeqCst);
                        stats.dropped += 1;
                    }
                }
            }
            WriterCommand::Close(ack) => {
                if !sink_closed {
                    sink_closed = true;
                    closed.store(true, Ordering::SeqCst);
                    match tokio::time::timeout(write_timeout, sink.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(error = %e, "Sink close failed"),
                        Err(_) => debug!("Sink close timed out"),
                    }
                    info!(written = stats.written, dropped = stats.dropped, "Outbound stream closed");
                }
                let _ = ack.send(stats);
            }
        }
    }

    if !sink_closed {
        let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    }
}
