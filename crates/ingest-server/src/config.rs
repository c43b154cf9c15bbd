use std::time::Duration;

use ingest_core::decode::DecoderKind;
use serde::{Deserialize, Serialize};

/// Read-only per-process settings handed to the session coordinator.
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Path of the WebSocket ingestion endpoint.
    pub endpoint_path: String,
    /// `None` for an unbounded queue; `Some(n)` makes the receive loop wait
    /// once `n` envelopes are pending.
    pub queue_capacity: Option<usize>,
    /// Largest accepted frame.
    pub max_frame_bytes: usize,
    pub retry: RetryPolicy,
    pub liveness: LivenessConfig,
    pub decoder: DecoderKind,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            endpoint_path: "/".into(),
            queue_capacity: None,
            max_frame_bytes: 16 * 1024 * 1024,
            retry: RetryPolicy::default(),
            liveness: LivenessConfig::default(),
            decoder: DecoderKind::default(),
        }
    }
}

/// What happens to an envelope once every durability attempt has failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Log it and move on.
    #[default]
    Drop,
    /// Record it in the dead-letter table.
    DeadLetter,
}

impl std::str::FromStr for ExhaustedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "dead_letter" | "dead-letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown exhausted policy: {other}")),
        }
    }
}

/// Retry behaviour for failed durability writes.
///
/// The default (`max_attempts = 1`, `Drop`) makes a single attempt and
/// discards the envelope on failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub on_exhausted: ExhaustedPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            on_exhausted: ExhaustedPolicy::Drop,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Transport liveness tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Keep-alive ping cadence.
    pub ping_interval: Duration,
    /// Upper bound on how long a silent transport is tolerated before the
    /// session is cancelled.
    pub idle_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}
