//! Session coordination: one accepted connection, three tasks.
//!
//! ```text
//!  transport ──> ReceiveLoop ──> EventQueue ──> PersistenceConsumer ──> sink
//!      ^  \                                          (never cancelled)
//!      |   LinkMonitor ──> LivenessWatcher ── cancel ──> ReceiveLoop
//!      └── writer half ── pings, then back to the coordinator for close
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use ingest_core::{ConnectionId, IngestError, PayloadDecoder, SessionState, StateCell};
use ingest_store::EnvelopeSink;
use ingest_telemetry::metrics::{self, MetricsRecorder};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::IngestConfig;
use crate::consumer::{ConsumerReport, PersistenceConsumer};
use crate::queue::EventQueue;
use crate::receive::{ReceiveLoop, ReceiveOutcome};
use crate::transport::{CloseInfo, FrameReader, FrameWriter, LinkMonitor};
use crate::watcher::{LivenessWatcher, WatchOutcome};

/// Close code sent when the server itself ends the session.
const GOING_AWAY: u16 = 1001;

/// Live sessions, keyed by connection id.
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, watch::Receiver<SessionState>>,
    active: watch::Sender<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            sessions: DashMap::new(),
            active,
        }
    }

    pub fn register(&self, id: ConnectionId, state: watch::Receiver<SessionState>) {
        self.sessions.insert(id, state);
        self.publish();
    }

    pub fn unregister(&self, id: &ConnectionId) {
        self.sessions.remove(id);
        self.publish();
    }

    /// Length is read under the watch lock, so concurrent publishers are
    /// serialized and the last one always sees the final map.
    fn publish(&self) {
        self.active.send_modify(|n| *n = self.sessions.len());
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Resolves once no session is registered.
    pub async fn wait_empty(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A session that has been accepted but not yet run.
pub struct Session {
    connection_id: ConnectionId,
    state: StateCell,
}

impl Session {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

/// Summary of a finished session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub connection_id: ConnectionId,
    pub outcome: &'static str,
    pub close: Option<CloseInfo>,
    pub received: u64,
    pub consumer: ConsumerReport,
    pub watcher: Option<WatchOutcome>,
}

/// Owns the lifecycle of every session the process accepts.
pub struct SessionCoordinator {
    config: Arc<IngestConfig>,
    sink: Arc<dyn EnvelopeSink>,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsRecorder>,
    shutdown: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(config: Arc<IngestConfig>, sink: Arc<dyn EnvelopeSink>, metrics: Arc<MetricsRecorder>) -> Self {
        let decoder = config.decoder.build();
        Self {
            config,
            sink,
            decoder,
            registry: Arc::new(SessionRegistry::new()),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the configured decoder (`None` disables decoding).
    pub fn with_decoder(mut self, decoder: Option<Arc<dyn PayloadDecoder>>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Create and register a session in `Open`.
    pub fn open(&self) -> Session {
        let session = Session {
            connection_id: ConnectionId::new(),
            state: StateCell::new(),
        };
        self.registry.register(session.connection_id.clone(), session.state.subscribe());
        self.metrics.counter_inc(metrics::SESSIONS_OPENED, &[], 1);
        self.metrics.gauge_add(metrics::SESSIONS_ACTIVE, &[], 1);
        session
    }

    /// Cancel every running session and wait for all of them to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.wait_empty().await;
    }

    /// Drive a session to `Closed`.
    ///
    /// Everything received before the transport ended is persisted (or
    /// handled by the retry policy) before the transport is closed and the
    /// session is unregistered.
    pub async fn run<R, W>(&self, session: Session, reader: R, writer: W, link: LinkMonitor) -> SessionReport
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let span = info_span!("session", connection_id = %session.connection_id);
        self.drive(session, reader, writer, link, span.clone()).instrument(span).await
    }

    async fn drive<R, W>(
        &self,
        session: Session,
        reader: R,
        writer: W,
        link: LinkMonitor,
        span: tracing::Span,
    ) -> SessionReport
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let Session { connection_id, state } = session;
        info!("session opened");

        let cancel = self.shutdown.child_token();
        let (queue_tx, queue_rx) = EventQueue::channel(self.config.queue_capacity, Arc::clone(&self.metrics));

        let receive = tokio::spawn(
            ReceiveLoop::new(
                reader,
                link.clone(),
                connection_id.clone(),
                queue_tx,
                cancel.clone(),
                Arc::clone(&self.metrics),
            )
            .run()
            .instrument(span.clone()),
        );
        let consumer = tokio::spawn(
            PersistenceConsumer::new(
                Arc::clone(&self.sink),
                self.decoder.clone(),
                self.config.retry.clone(),
                Arc::clone(&self.metrics),
            )
            .run(queue_rx)
            .instrument(span.clone()),
        );
        let watcher = tokio::spawn(
            LivenessWatcher::new(
                writer,
                link.subscribe(),
                state.subscribe(),
                cancel.clone(),
                self.config.liveness.clone(),
            )
            .run()
            .instrument(span),
        );

        let (outcome, queue_tx) = match receive.await {
            Ok((outcome, queue_tx)) => (outcome, Some(queue_tx)),
            Err(e) => {
                error!(error = %e, "receive task failed");
                (
                    ReceiveOutcome::Aborted(IngestError::TransportAborted(format!("receive task failed: {e}"))),
                    None,
                )
            }
        };
        if let ReceiveOutcome::Aborted(e) = &outcome {
            debug!(error = %e, error_kind = e.error_kind(), "receive loop aborted");
        }

        state.advance(SessionState::Draining);
        let received = queue_tx.map(|tx| tx.complete()).unwrap_or_default();
        debug!(outcome = outcome.label(), received, "draining");

        let consumer_report = match consumer.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "persistence task failed");
                ConsumerReport::default()
            }
        };

        let close = match &outcome {
            ReceiveOutcome::Closed(close) => close.clone(),
            ReceiveOutcome::Cancelled if self.shutdown.is_cancelled() => Some(CloseInfo {
                code: GOING_AWAY,
                reason: "server shutting down".into(),
            }),
            _ => None,
        };
        let watch_outcome = match watcher.await {
            Ok((watch_outcome, mut writer)) => {
                if let Err(e) = writer.close(close.clone()).await {
                    debug!(error = %e, "transport close failed");
                }
                Some(watch_outcome)
            }
            Err(e) => {
                error!(error = %e, "liveness task failed");
                None
            }
        };

        state.advance(SessionState::Closed);
        self.registry.unregister(&connection_id);
        self.metrics.gauge_add(metrics::SESSIONS_ACTIVE, &[], -1);
        self.metrics
            .counter_inc(metrics::SESSIONS_ENDED, &[("outcome", outcome.label())], 1);

        info!(
            outcome = outcome.label(),
            received,
            persisted = consumer_report.persisted,
            failed = consumer_report.failed,
            dead_lettered = consumer_report.dead_lettered,
            "session closed"
        );

        SessionReport {
            connection_id,
            outcome: outcome.label(),
            close: match outcome {
                ReceiveOutcome::Closed(close) => close,
                _ => None,
            },
            received,
            consumer: consumer_report,
            watcher: watch_outcome,
        }
    }
}
