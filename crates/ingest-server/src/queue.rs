//! Per-session FIFO between the receive loop and the persistence consumer.
//!
//! One writer, one reader. Completing the writer lets the reader drain what
//! is already queued and then observe end-of-stream.

use std::sync::Arc;

use ingest_core::EventEnvelope;
use ingest_telemetry::metrics::{self, MetricsRecorder};
use tokio::sync::mpsc;

/// The queue was torn down before the envelope could be enqueued.
#[derive(Debug, thiserror::Error)]
#[error("event queue closed; envelope {} not enqueued", .0.sequence())]
pub struct QueueClosed(pub EventEnvelope);

enum Tx {
    Unbounded(mpsc::UnboundedSender<EventEnvelope>),
    Bounded(mpsc::Sender<EventEnvelope>),
}

enum Rx {
    Unbounded(mpsc::UnboundedReceiver<EventEnvelope>),
    Bounded(mpsc::Receiver<EventEnvelope>),
}

pub struct EventQueue;

impl EventQueue {
    /// Build a queue. `None` is unbounded; `Some(n)` holds at most `n`
    /// pending envelopes and makes `enqueue` wait when full.
    pub fn channel(capacity: Option<usize>, metrics: Arc<MetricsRecorder>) -> (QueueWriter, QueueReader) {
        let (tx, rx) = match capacity {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Tx::Unbounded(tx), Rx::Unbounded(rx))
            }
            Some(n) => {
                let (tx, rx) = mpsc::channel(n.max(1));
                (Tx::Bounded(tx), Rx::Bounded(rx))
            }
        };
        (
            QueueWriter {
                tx,
                enqueued: 0,
                metrics: Arc::clone(&metrics),
            },
            QueueReader { rx, metrics },
        )
    }
}

/// Producer half; owned by the receive loop.
pub struct QueueWriter {
    tx: Tx,
    enqueued: u64,
    metrics: Arc<MetricsRecorder>,
}

impl QueueWriter {
    /// Append an envelope. Only waits when the queue is bounded and full.
    pub async fn enqueue(&mut self, envelope: EventEnvelope) -> Result<(), QueueClosed> {
        let sent = match &self.tx {
            Tx::Unbounded(tx) => tx.send(envelope).map_err(|e| QueueClosed(e.0)),
            Tx::Bounded(tx) => tx.send(envelope).await.map_err(|e| QueueClosed(e.0)),
        };
        sent?;
        self.enqueued += 1;
        self.metrics.gauge_add(metrics::QUEUE_DEPTH, &[], 1);
        Ok(())
    }

    /// Whether `enqueue` would complete without waiting. Stays true until
    /// this writer enqueues again, since only the reader frees slots.
    pub fn has_room(&self) -> bool {
        match &self.tx {
            Tx::Unbounded(_) => true,
            Tx::Bounded(tx) => tx.capacity() > 0,
        }
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued
    }

    /// Mark the queue complete. Returns how many envelopes were enqueued.
    pub fn complete(self) -> u64 {
        self.enqueued
    }
}

/// Consumer half; owned by the persistence consumer.
pub struct QueueReader {
    rx: Rx,
    metrics: Arc<MetricsRecorder>,
}

impl QueueReader {
    /// Next envelope in enqueue order, or `None` once the writer completed
    /// and everything queued before that has been taken.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        let envelope = match &mut self.rx {
            Rx::Unbounded(rx) => rx.recv().await,
            Rx::Bounded(rx) => rx.recv().await,
        }?;
        self.metrics.gauge_add(metrics::QUEUE_DEPTH, &[], -1);
        Some(envelope)
    }
}
