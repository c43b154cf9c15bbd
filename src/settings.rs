//! Process settings with deep merge and CLI/env overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a settings file was given, deep-merge its values over the defaults
//! 3. Apply CLI flags / `APEX_INGEST_*` environment variables (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};
use std::time::Duration;

use ingest_core::DecoderKind;
use ingest_server::{ExhaustedPolicy, IngestConfig, LivenessConfig, RetryPolicy, ServerConfig};
use ingest_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Level;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    pub bind: String,
    pub endpoint_path: String,
    /// Database file, or `:memory:`.
    pub database: String,
    pub queue_capacity: Option<usize>,
    pub max_frame_bytes: usize,
    pub retry: RetrySettings,
    pub liveness: LivenessSettings,
    pub decoder: DecoderKind,
    pub telemetry: TelemetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        let ingest = IngestConfig::default();
        Self {
            bind: "0.0.0.0:9091".into(),
            endpoint_path: ingest.endpoint_path,
            database: "apex-ingest.db".into(),
            queue_capacity: ingest.queue_capacity,
            max_frame_bytes: ingest.max_frame_bytes,
            retry: RetrySettings::default(),
            liveness: LivenessSettings::default(),
            decoder: ingest.decoder,
            telemetry: TelemetrySettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub on_exhausted: ExhaustedPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            on_exhausted: ExhaustedPolicy::Drop,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    pub ping_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 10,
            idle_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    /// Persist warn+ logs to this SQLite file.
    pub log_db: Option<PathBuf>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_db: None,
        }
    }
}

impl Settings {
    /// Defaults, with `path` deep-merged over them when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = serde_json::to_value(Settings::default())?;
        let merged = match path {
            Some(path) => {
                tracing::debug!(?path, "loading settings from file");
                let content = std::fs::read_to_string(path)?;
                let user: Value = serde_json::from_str(&content)?;
                deep_merge(defaults, user)
            }
            None => defaults,
        };
        Ok(serde_json::from_value(merged)?)
    }

    /// Validate and build the read-only server configuration.
    pub fn server_config(&self) -> Result<ServerConfig> {
        if !self.endpoint_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "endpoint_path must start with '/': {}",
                self.endpoint_path
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::InvalidValue("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(SettingsError::InvalidValue(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.liveness.ping_interval_secs == 0 {
            return Err(SettingsError::InvalidValue("liveness.ping_interval_secs must be positive".into()));
        }
        if self.liveness.idle_timeout_secs <= self.liveness.ping_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "liveness.idle_timeout_secs ({}) must exceed ping_interval_secs ({})",
                self.liveness.idle_timeout_secs, self.liveness.ping_interval_secs
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(SettingsError::InvalidValue("queue_capacity must be positive when set".into()));
        }

        Ok(ServerConfig {
            bind: self.bind.clone(),
            ingest: IngestConfig {
                endpoint_path: self.endpoint_path.clone(),
                queue_capacity: self.queue_capacity,
                max_frame_bytes: self.max_frame_bytes,
                retry: RetryPolicy {
                    max_attempts: self.retry.max_attempts,
                    base_delay: Duration::from_millis(self.retry.base_delay_ms),
                    max_delay: Duration::from_millis(self.retry.max_delay_ms),
                    on_exhausted: self.retry.on_exhausted,
                },
                liveness: LivenessConfig {
                    ping_interval: Duration::from_secs(self.liveness.ping_interval_secs),
                    idle_timeout: Duration::from_secs(self.liveness.idle_timeout_secs),
                },
                decoder: self.decoder,
            },
        })
    }

    pub fn telemetry_config(&self) -> Result<TelemetryConfig> {
        let log_level = self
            .telemetry
            .log_level
            .parse::<Level>()
            .map_err(|_| SettingsError::InvalidValue(format!("unknown log level: {}", self.telemetry.log_level)))?;
        Ok(TelemetryConfig {
            log_level,
            log_db_path: self.telemetry.log_db.clone(),
            ..TelemetryConfig::default()
        })
    }
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        let config = settings.server_config().unwrap();
        assert_eq!(config.bind, "0.0.0.0:9091");
        assert_eq!(config.ingest.endpoint_path, "/");
        assert_eq!(config.ingest.retry, RetryPolicy::default());
        assert_eq!(config.ingest.liveness, LivenessConfig::default());
        assert_eq!(config.ingest.decoder, DecoderKind::Protobuf);
    }

    #[test]
    fn deep_merge_nested_and_skips_null() {
        let merged = deep_merge(
            json!({"retry": {"max_attempts": 1, "base_delay_ms": 100}, "bind": "a"}),
            json!({"retry": {"max_attempts": 4}, "bind": null}),
        );
        assert_eq!(merged["retry"]["max_attempts"], 4);
        assert_eq!(merged["retry"]["base_delay_ms"], 100);
        assert_eq!(merged["bind"], "a");
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoint_path": "/events", "retry": {{"max_attempts": 3, "on_exhausted": "dead_letter"}}, "decoder": "hex"}}"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.endpoint_path, "/events");
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.on_exhausted, ExhaustedPolicy::DeadLetter);
        assert_eq!(settings.retry.max_delay_ms, 5_000);
        assert_eq!(settings.decoder, DecoderKind::Hex);
        assert_eq!(settings.liveness, LivenessSettings::default());
    }

    #[test]
    fn load_rejects_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(Settings::load(Some(file.path())), Err(SettingsError::Json(_))));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(Settings::load(Some(&missing)), Err(SettingsError::Io(_))));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut s = Settings::default();
        s.endpoint_path = "ingest".into();
        assert!(s.server_config().is_err());

        let mut s = Settings::default();
        s.retry.max_attempts = 0;
        assert!(s.server_config().is_err());

        let mut s = Settings::default();
        s.liveness.idle_timeout_secs = s.liveness.ping_interval_secs;
        assert!(s.server_config().is_err());

        let mut s = Settings::default();
        s.queue_capacity = Some(0);
        assert!(s.server_config().is_err());
    }

    #[test]
    fn telemetry_level_parses() {
        let mut s = Settings::default();
        s.telemetry.log_level = "debug".into();
        assert_eq!(s.telemetry_config().unwrap().log_level, Level::DEBUG);

        s.telemetry.log_level = "loud".into();
        assert!(matches!(s.telemetry_config(), Err(SettingsError::InvalidValue(_))));
    }
}
