//! Persistence consumer: drains one session's queue into the durable sink.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use ingest_core::{DecodeError, EventEnvelope, IngestError, PayloadDecoder};
use ingest_store::{EnvelopeSink, RecordId};
use ingest_telemetry::metrics::{self, MetricsRecorder};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::{ExhaustedPolicy, RetryPolicy};
use crate::queue::QueueReader;

/// Larger payloads are decoded on the blocking pool.
const INLINE_DECODE_BYTES: usize = 64 * 1024;

/// Per-session persistence tally.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub persisted: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub decode_failures: u64,
}

pub struct PersistenceConsumer {
    sink: Arc<dyn EnvelopeSink>,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    retry: RetryPolicy,
    metrics: Arc<MetricsRecorder>,
}

impl PersistenceConsumer {
    pub fn new(
        sink: Arc<dyn EnvelopeSink>,
        decoder: Option<Arc<dyn PayloadDecoder>>,
        retry: RetryPolicy,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            sink,
            decoder,
            retry,
            metrics,
        }
    }

    /// Drain the queue until it is complete and empty. A failure on one
    /// envelope never stops the ones behind it.
    pub async fn run(self, mut queue: QueueReader) -> ConsumerReport {
        let mut report = ConsumerReport::default();

        while let Some(envelope) = queue.next().await {
            match self.persist(&envelope, &mut report).await {
                Ok(id) => {
                    report.persisted += 1;
                    self.metrics.counter_inc(metrics::ENVELOPES_PERSISTED, &[], 1);
                    debug!(sequence = envelope.sequence(), record_id = id.0, "envelope persisted");
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.counter_inc(metrics::ENVELOPES_FAILED, &[], 1);
                    self.exhausted(&envelope, &e, &mut report).await;
                }
            }

            if let Some(decoder) = &self.decoder {
                if let Err(e) = decode_off_worker(decoder, envelope.payload()).await {
                    report.decode_failures += 1;
                    self.metrics.counter_inc(metrics::DECODE_FAILURES, &[("decoder", decoder.name())], 1);
                    debug!(sequence = envelope.sequence(), decoder = decoder.name(), error = %e, "payload decode failed");
                }
            }
        }

        report
    }

    async fn persist(&self, envelope: &EventEnvelope, report: &mut ConsumerReport) -> Result<RecordId, IngestError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = self.sink.insert(envelope).await;
            self.metrics.histogram_observe(
                metrics::PERSIST_DURATION_MS,
                &[],
                started.elapsed().as_secs_f64() * 1000.0,
            );

            let e = match result {
                Ok(id) => return Ok(id),
                Err(e) => IngestError::from(e),
            };
            if attempt >= max_attempts {
                return Err(e);
            }

            let delay = self.retry.delay_after(attempt);
            warn!(
                sequence = envelope.sequence(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "durability write failed, retrying"
            );
            report.retried += 1;
            self.metrics.counter_inc(metrics::ENVELOPES_RETRIED, &[], 1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn exhausted(&self, envelope: &EventEnvelope, cause: &IngestError, report: &mut ConsumerReport) {
        let attempts = self.retry.max_attempts.max(1);
        match self.retry.on_exhausted {
            ExhaustedPolicy::Drop => {
                error!(
                    sequence = envelope.sequence(),
                    attempts,
                    error_kind = cause.error_kind(),
                    error = %cause,
                    "durability write failed, envelope dropped"
                );
            }
            ExhaustedPolicy::DeadLetter => match self.sink.dead_letter(envelope, &cause.to_string(), attempts).await {
                Ok(id) => {
                    report.dead_lettered += 1;
                    self.metrics.counter_inc(metrics::ENVELOPES_DEAD_LETTERED, &[], 1);
                    warn!(
                        sequence = envelope.sequence(),
                        attempts,
                        dead_letter_id = id.0,
                        error = %cause,
                        "durability write failed, envelope dead-lettered"
                    );
                }
                Err(dl) => {
                    error!(
                        sequence = envelope.sequence(),
                        attempts,
                        error = %cause,
                        dead_letter_error = %dl,
                        "durability write and dead-letter both failed, envelope dropped"
                    );
                }
            },
        }
    }
}

/// Decode small payloads in place; hand large ones to `spawn_blocking` so a
/// multi-megabyte walk does not stall the runtime worker.
async fn decode_off_worker(decoder: &Arc<dyn PayloadDecoder>, payload: &Bytes) -> Result<(), DecodeError> {
    if payload.len() <= INLINE_DECODE_BYTES {
        return decode_guarded(decoder.as_ref(), payload);
    }
    let decoder = Arc::clone(decoder);
    let payload = payload.clone();
    tokio::task::spawn_blocking(move || decode_guarded(decoder.as_ref(), &payload))
        .await
        .unwrap_or_else(|e| Err(DecodeError::Panicked(e.to_string())))
}

/// Run a decoder, converting a panic into a `DecodeError`.
fn decode_guarded(decoder: &dyn PayloadDecoder, payload: &[u8]) -> Result<(), DecodeError> {
    match catch_unwind(AssertUnwindSafe(|| decoder.decode(payload))) {
        Ok(Ok(decoded)) => {
            debug!(decoded = %decoded, "payload decoded");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(DecodeError::Panicked(msg))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory sinks and decoders with fault injection.

    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use ingest_core::DecodedPayload;
    use ingest_store::StoreError;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct State {
        rows: Vec<EventEnvelope>,
        dead: Vec<(EventEnvelope, String, u32)>,
        /// Remaining forced failures per sequence number.
        faults: HashMap<u64, u32>,
        attempts: HashMap<u64, u32>,
    }

    /// Sink that keeps committed envelopes in memory and can be told to fail
    /// particular sequence numbers.
    #[derive(Default)]
    pub struct MemorySink {
        state: Mutex<State>,
        latency: Mutex<Option<Duration>>,
    }

    impl MemorySink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make every insert take `latency` before it commits.
        pub fn slow(&self, latency: Duration) {
            *self.latency.lock() = Some(latency);
        }

        /// Fail the next `times` inserts of `sequence`.
        pub fn fail(&self, sequence: u64, times: u32) {
            self.state.lock().faults.insert(sequence, times);
        }

        pub fn persisted(&self) -> Vec<EventEnvelope> {
            self.state.lock().rows.clone()
        }

        pub fn sequences(&self) -> Vec<u64> {
            self.state.lock().rows.iter().map(|e| e.sequence()).collect()
        }

        pub fn dead_letters(&self) -> Vec<(u64, u32)> {
            self.state
                .lock()
                .dead
                .iter()
                .map(|(e, _, attempts)| (e.sequence(), *attempts))
                .collect()
        }

        pub fn attempts(&self, sequence: u64) -> u32 {
            self.state.lock().attempts.get(&sequence).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl EnvelopeSink for MemorySink {
        async fn insert(&self, envelope: &EventEnvelope) -> Result<RecordId, StoreError> {
            let latency = *self.latency.lock();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let mut state = self.state.lock();
            *state.attempts.entry(envelope.sequence()).or_default() += 1;
            if let Some(remaining) = state.faults.get_mut(&envelope.sequence()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Database(format!("injected fault at {}", envelope.sequence())));
                }
            }
            state.rows.push(envelope.clone());
            Ok(RecordId(state.rows.len() as i64))
        }

        async fn dead_letter(&self, envelope: &EventEnvelope, error: &str, attempts: u32) -> Result<RecordId, StoreError> {
            let mut state = self.state.lock();
            state.dead.push((envelope.clone(), error.to_string(), attempts));
            Ok(RecordId(state.dead.len() as i64))
        }
    }

    /// Decoder that errors on payloads starting with `0xEE` and panics on
    /// payloads starting with `0xFF`.
    pub struct FaultyDecoder;

    impl PayloadDecoder for FaultyDecoder {
        fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, DecodeError> {
            match payload.first() {
                Some(0xEE) => Err(DecodeError::Truncated { offset: 0 }),
                Some(0xFF) => panic!("decoder exploded"),
                _ => Ok(DecodedPayload {
                    format: "faulty",
                    summary: serde_json::Value::Null,
                }),
            }
        }

        fn name(&self) -> &'static str {
            "faulty"
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ingest_core::ConnectionId;

    use super::testing::{FaultyDecoder, MemorySink};
    use super::*;
    use crate::queue::EventQueue;

    async fn run_with(
        sink: Arc<MemorySink>,
        decoder: Option<Arc<dyn PayloadDecoder>>,
        retry: RetryPolicy,
        payloads: &[&[u8]],
    ) -> (ConsumerReport, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        let (mut tx, rx) = EventQueue::channel(None, Arc::clone(&metrics));
        let sender = ConnectionId::new();
        for (seq, payload) in payloads.iter().enumerate() {
            tx.enqueue(EventEnvelope::new(sender.clone(), seq as u64, payload.to_vec()))
                .await
                .unwrap();
        }
        tx.complete();

        let consumer = PersistenceConsumer::new(sink, decoder, retry, Arc::clone(&metrics));
        (consumer.run(rx).await, metrics)
    }

    #[tokio::test]
    async fn persists_everything_in_order() {
        let sink = MemorySink::new();
        let (report, metrics) = run_with(Arc::clone(&sink), None, RetryPolicy::default(), &[b"a", b"b", b"c"]).await;

        assert_eq!(report.persisted, 3);
        assert_eq!(sink.sequences(), vec![0, 1, 2]);
        assert_eq!(metrics.counter_get(metrics::ENVELOPES_PERSISTED, &[]), 3);
        assert_eq!(metrics.histogram_summary(metrics::PERSIST_DURATION_MS, &[]).count, 3);
    }

    #[tokio::test]
    async fn failed_envelope_is_dropped_and_rest_continue() {
        let sink = MemorySink::new();
        sink.fail(1, u32::MAX);
        let (report, metrics) = run_with(Arc::clone(&sink), None, RetryPolicy::default(), &[b"a", b"b", b"c"]).await;

        assert_eq!(sink.sequences(), vec![0, 2]);
        assert_eq!(sink.attempts(1), 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
        assert!(sink.dead_letters().is_empty());
        assert_eq!(metrics.counter_get(metrics::ENVELOPES_FAILED, &[]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_succeeds_on_retry() {
        let sink = MemorySink::new();
        sink.fail(0, 2);
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            on_exhausted: ExhaustedPolicy::Drop,
        };

        let started = tokio::time::Instant::now();
        let (report, _) = run_with(Arc::clone(&sink), None, retry, &[b"a"]).await;

        assert_eq!(sink.sequences(), vec![0]);
        assert_eq!(sink.attempts(0), 3);
        assert_eq!(report.retried, 2);
        assert_eq!(report.failed, 0);
        // 100ms + 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter() {
        let sink = MemorySink::new();
        sink.fail(1, u32::MAX);
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            on_exhausted: ExhaustedPolicy::DeadLetter,
        };

        let (report, metrics) = run_with(Arc::clone(&sink), None, retry, &[b"a", b"b"]).await;

        assert_eq!(sink.sequences(), vec![0]);
        assert_eq!(sink.dead_letters(), vec![(1, 2)]);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(metrics.counter_get(metrics::ENVELOPES_DEAD_LETTERED, &[]), 1);
    }

    #[tokio::test]
    async fn decode_errors_and_panics_never_block_persistence() {
        let sink = MemorySink::new();
        let decoder: Arc<dyn PayloadDecoder> = Arc::new(FaultyDecoder);
        let (report, metrics) = run_with(
            Arc::clone(&sink),
            Some(decoder),
            RetryPolicy::default(),
            &[&[0xEE], &[0xFF], &[0x01]],
        )
        .await;

        assert_eq!(sink.sequences(), vec![0, 1, 2]);
        assert_eq!(report.decode_failures, 2);
        assert_eq!(metrics.counter_get(metrics::DECODE_FAILURES, &[("decoder", "faulty")]), 2);
    }

    #[tokio::test]
    async fn large_payloads_decode_on_blocking_pool() {
        let sink = MemorySink::new();
        let decoder: Arc<dyn PayloadDecoder> = Arc::new(FaultyDecoder);
        let mut exploding = vec![0xFF];
        exploding.resize(INLINE_DECODE_BYTES + 1, 0);
        let mut fine = vec![0x01];
        fine.resize(INLINE_DECODE_BYTES * 4, 0);

        let (report, _) = run_with(
            Arc::clone(&sink),
            Some(decoder),
            RetryPolicy::default(),
            &[exploding.as_slice(), fine.as_slice()],
        )
        .await;

        assert_eq!(sink.sequences(), vec![0, 1]);
        assert_eq!(report.decode_failures, 1);
    }

    #[tokio::test]
    async fn blocking_decode_reports_panic_message() {
        let decoder: Arc<dyn PayloadDecoder> = Arc::new(FaultyDecoder);
        let mut payload = vec![0xFF];
        payload.resize(INLINE_DECODE_BYTES * 2, 0);

        let err = decode_off_worker(&decoder, &Bytes::from(payload)).await.unwrap_err();
        assert_eq!(err, DecodeError::Panicked("decoder exploded".into()));
    }

    #[test]
    fn decode_guard_reports_panic_message() {
        let err = decode_guarded(&FaultyDecoder, &[0xFF]).unwrap_err();
        assert_eq!(err, DecodeError::Panicked("decoder exploded".into()));
    }
}
