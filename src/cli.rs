use std::path::PathBuf;

use clap::Parser;
use ingest_core::DecoderKind;
use ingest_server::ExhaustedPolicy;

use crate::settings::Settings;

/// WebSocket event ingestion endpoint.
#[derive(Debug, Parser)]
#[command(name = "apex-ingest", version)]
pub struct Cli {
    /// JSON settings file, deep-merged over the defaults.
    #[arg(long, env = "APEX_INGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, e.g. `0.0.0.0:9091`.
    #[arg(long, env = "APEX_INGEST_BIND")]
    pub bind: Option<String>,

    /// Path of the WebSocket endpoint.
    #[arg(long, env = "APEX_INGEST_ENDPOINT_PATH")]
    pub endpoint_path: Option<String>,

    /// Database file, or `:memory:`.
    #[arg(long, env = "APEX_INGEST_DATABASE")]
    pub database: Option<String>,

    /// Bound the per-session queue; unbounded when unset.
    #[arg(long, env = "APEX_INGEST_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    #[arg(long, env = "APEX_INGEST_RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: Option<u32>,

    /// `drop` or `dead_letter`.
    #[arg(long, env = "APEX_INGEST_RETRY_ON_EXHAUSTED")]
    pub on_exhausted: Option<ExhaustedPolicy>,

    #[arg(long, env = "APEX_INGEST_PING_INTERVAL_SECS")]
    pub ping_interval_secs: Option<u64>,

    #[arg(long, env = "APEX_INGEST_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// `protobuf`, `hex` or `none`.
    #[arg(long, env = "APEX_INGEST_DECODER")]
    pub decoder: Option<DecoderKind>,

    #[arg(long, env = "APEX_INGEST_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Persist warn+ logs to this SQLite file.
    #[arg(long, env = "APEX_INGEST_LOG_DB")]
    pub log_db: Option<PathBuf>,
}

impl Cli {
    /// Overlay every flag that was given onto `settings`.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.bind {
            settings.bind = v.clone();
        }
        if let Some(v) = &self.endpoint_path {
            settings.endpoint_path = v.clone();
        }
        if let Some(v) = &self.database {
            settings.database = v.clone();
        }
        if let Some(v) = self.queue_capacity {
            settings.queue_capacity = Some(v);
        }
        if let Some(v) = self.retry_max_attempts {
            settings.retry.max_attempts = v;
        }
        if let Some(v) = self.on_exhausted {
            settings.retry.on_exhausted = v;
        }
        if let Some(v) = self.ping_interval_secs {
            settings.liveness.ping_interval_secs = v;
        }
        if let Some(v) = self.idle_timeout_secs {
            settings.liveness.idle_timeout_secs = v;
        }
        if let Some(v) = self.decoder {
            settings.decoder = v;
        }
        if let Some(v) = &self.log_level {
            settings.telemetry.log_level = v.clone();
        }
        if let Some(v) = &self.log_db {
            settings.telemetry.log_db = Some(v.clone());
        }
    }
}
