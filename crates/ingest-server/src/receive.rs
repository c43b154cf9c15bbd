use std::sync::Arc;

use ingest_core::{ConnectionId, EventEnvelope, IngestError};
use ingest_telemetry::metrics::{self, MetricsRecorder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::queue::QueueWriter;
use crate::transport::{CloseInfo, Frame, FrameReader, LinkMonitor};

/// Why the receive loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Peer sent a close frame.
    Closed(Option<CloseInfo>),
    /// Stream ended or errored without a close handshake, or the queue's
    /// consumer went away.
    Aborted(IngestError),
    /// The session's cancellation signal fired.
    Cancelled,
}

impl ReceiveOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed(_) => "closed",
            Self::Aborted(_) => "aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Reads frames off the transport and enqueues one envelope per data frame.
///
/// Never touches storage; persistence speed cannot stall reads unless the
/// queue is bounded. While it waits on a full queue the link is held so the
/// watcher does not mistake the pause for a silent peer.
pub struct ReceiveLoop<R> {
    reader: R,
    link: LinkMonitor,
    connection_id: ConnectionId,
    queue: QueueWriter,
    cancel: CancellationToken,
    metrics: Arc<MetricsRecorder>,
}

impl<R: FrameReader> ReceiveLoop<R> {
    pub fn new(
        reader: R,
        link: LinkMonitor,
        connection_id: ConnectionId,
        queue: QueueWriter,
        cancel: CancellationToken,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            reader,
            link,
            connection_id,
            queue,
            cancel,
            metrics,
        }
    }

    /// Run until close, abort, or cancellation. Hands the queue writer back
    /// so the caller decides when the queue is complete.
    pub async fn run(self) -> (ReceiveOutcome, QueueWriter) {
        let Self {
            mut reader,
            link,
            connection_id,
            mut queue,
            cancel,
            metrics,
        } = self;
        let mut sequence = 0u64;

        let outcome = loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => break ReceiveOutcome::Cancelled,
                frame = reader.recv() => frame,
            };

            match frame {
                Some(Ok(Frame::Data(payload))) => {
                    trace!(sequence, bytes = payload.len(), "frame received");
                    let envelope = EventEnvelope::new(connection_id.clone(), sequence, payload);
                    let enqueued = if queue.has_room() {
                        queue.enqueue(envelope).await
                    } else {
                        debug!(sequence, "queue full, holding reads");
                        link.hold();
                        let enqueued = queue.enqueue(envelope).await;
                        link.release();
                        enqueued
                    };
                    if let Err(e) = enqueued {
                        break ReceiveOutcome::Aborted(IngestError::PersistenceFailure(e.to_string()));
                    }
                    metrics.counter_inc(metrics::ENVELOPES_RECEIVED, &[], 1);
                    sequence += 1;
                }
                Some(Ok(Frame::Control)) => {}
                Some(Ok(Frame::Close(close))) => break ReceiveOutcome::Closed(close),
                Some(Err(e)) => break ReceiveOutcome::Aborted(e.into()),
                None => {
                    break ReceiveOutcome::Aborted(IngestError::TransportAborted(
                        "stream ended without close frame".into(),
                    ))
                }
            }
        };

        debug!(outcome = outcome.label(), received = queue.enqueued(), "receive loop finished");
        (outcome, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use crate::transport::fake;

    fn setup() -> (
        ReceiveLoop<fake::FakeReader>,
        crate::queue::QueueReader,
        fake::FakePeer,
        CancellationToken,
        Arc<MetricsRecorder>,
    ) {
        let metrics = Arc::new(MetricsRecorder::new());
        let (reader, _writer, monitor, peer) = fake::transport();
        let (tx, rx) = EventQueue::channel(None, Arc::clone(&metrics));
        let cancel = CancellationToken::new();
        let recv = ReceiveLoop::new(reader, monitor, ConnectionId::new(), tx, cancel.clone(), Arc::clone(&metrics));
        (recv, rx, peer, cancel, metrics)
    }

    #[tokio::test]
    async fn data_frames_become_sequenced_envelopes() {
        let (recv, mut rx, peer, _cancel, metrics) = setup();
        peer.send(b"a");
        peer.pong();
        peer.send(b"b");
        peer.close(1000, "bye");

        let (outcome, writer) = recv.run().await;
        assert_eq!(
            outcome,
            ReceiveOutcome::Closed(Some(CloseInfo {
                code: 1000,
                reason: "bye".into()
            }))
        );
        assert_eq!(writer.complete(), 2);

        let first = rx.next().await.unwrap();
        let second = rx.next().await.unwrap();
        assert_eq!((first.sequence(), first.payload().as_ref()), (0, &b"a"[..]));
        assert_eq!((second.sequence(), second.payload().as_ref()), (1, &b"b"[..]));
        assert_eq!(first.sender_id(), second.sender_id());
        assert!(rx.next().await.is_none());
        assert_eq!(metrics.counter_get(metrics::ENVELOPES_RECEIVED, &[]), 2);
    }

    #[tokio::test]
    async fn end_of_stream_is_abort() {
        let (recv, _rx, mut peer, _cancel, _metrics) = setup();
        peer.send(b"a");
        peer.disconnect();

        let (outcome, writer) = recv.run().await;
        assert_eq!(outcome.label(), "aborted");
        assert!(matches!(outcome, ReceiveOutcome::Aborted(ref e) if e.error_kind() == "transport_aborted"));
        assert_eq!(writer.enqueued(), 1);
    }

    #[tokio::test]
    async fn transport_error_is_abort() {
        let (recv, _rx, peer, _cancel, _metrics) = setup();
        peer.reset();

        let (outcome, _writer) = recv.run().await;
        assert!(matches!(outcome, ReceiveOutcome::Aborted(IngestError::TransportAborted(reason)) if reason.contains("reset")));
    }

    #[tokio::test]
    async fn full_queue_holds_the_link_until_room_frees() {
        let metrics = Arc::new(MetricsRecorder::new());
        let (reader, _writer, monitor, peer) = fake::transport();
        let (tx, mut rx) = EventQueue::channel(Some(1), Arc::clone(&metrics));
        let recv = ReceiveLoop::new(
            reader,
            monitor.clone(),
            ConnectionId::new(),
            tx,
            CancellationToken::new(),
            metrics,
        );
        let mut link = monitor.subscribe();

        peer.send(b"a");
        peer.send(b"b");
        let handle = tokio::spawn(recv.run());

        link.wait_for(|status| status.held).await.unwrap();
        assert_eq!(rx.next().await.unwrap().sequence(), 0);
        link.wait_for(|status| !status.held).await.unwrap();

        peer.close(1000, "");
        let (outcome, writer) = handle.await.unwrap();
        assert_eq!(outcome.label(), "closed");
        assert_eq!(writer.complete(), 2);
        assert_eq!(rx.next().await.unwrap().sequence(), 1);
    }

    #[tokio::test]
    async fn cancellation_unblocks_pending_read() {
        let (recv, _rx, _peer, cancel, _metrics) = setup();
        let handle = tokio::spawn(recv.run());

        tokio::task::yield_now().await;
        cancel.cancel();

        let (outcome, _writer) = handle.await.unwrap();
        assert_eq!(outcome, ReceiveOutcome::Cancelled);
    }
}
