use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// SQLite sink that persists warn+ logs, so per-envelope failures outlive
/// the process's stdout.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 span_id TEXT,
                 connection_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.connection_id,
            ],
        );
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    connection_id: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    connection_id: Option<String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        match field.name() {
            "message" => self.message = Some(val),
            "connection_id" => self.connection_id = Some(val.trim_matches('"').to_string()),
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "connection_id" => self.connection_id = Some(value.to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

/// Stored on spans so child events inherit the connection id.
struct SpanConnection(String);

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.connection_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(conn) = extensions.get::<SpanConnection>() {
                        visitor.connection_id = Some(conn.0.clone());
                        break;
                    }
                }
            }
        }

        let span_id = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.next())
            .map(|span| format!("{:?}", span.id()));

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            span_id,
            connection_id: visitor.connection_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if let (Some(connection_id), Some(span)) = (visitor.connection_id, ctx.span(id)) {
            span.extensions_mut().insert(SpanConnection(connection_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing_subscriber::layer::SubscriberExt;

    /// (level, message, connection_id, fields), newest first.
    type Row = (String, String, Option<String>, Option<String>);

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ingest-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    fn rows(sink: &SqliteLogSink) -> Vec<Row> {
        let conn = sink.conn.lock();
        let mut stmt = conn
            .prepare("SELECT level, message, connection_id, fields FROM logs ORDER BY id DESC")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap();
        rows.collect::<Result<Vec<Row>, _>>().unwrap()
    }

    fn warn_record(message: &str, connection_id: Option<&str>) -> LogInsert {
        LogInsert {
            timestamp: "2026-10-19T12:00:00Z".into(),
            level: "WARN".into(),
            target: "ingest_server::consumer".into(),
            message: message.into(),
            fields: None,
            span_id: None,
            connection_id: connection_id.map(str::to_string),
        }
    }

    #[test]
    fn sink_keeps_connection_id() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&warn_record("write failed", Some("conn_a")));
        sink.insert(&warn_record("write failed", None));

        let results = rows(&sink);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].2, None);
        assert_eq!(results[1].2.as_deref(), Some("conn_a"));
    }

    #[test]
    fn reopening_keeps_existing_rows() {
        let path = temp_db();
        SqliteLogSink::new(&path).unwrap().insert(&warn_record("first", None));

        let sink = SqliteLogSink::new(&path).unwrap();
        sink.insert(&warn_record("second", None));
        let messages: Vec<String> = rows(&sink).into_iter().map(|r| r.1).collect();
        assert_eq!(messages, vec!["second", "first"]);
    }

    #[test]
    fn layer_persists_only_warn_and_above_with_span_connection() {
        let sink = Arc::new(SqliteLogSink::new(&temp_db()).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("session", connection_id = "conn_span");
            let _entered = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(sequence = 4u64, "durability write failed");
        });

        let results = rows(&sink);
        assert_eq!(results.len(), 1);
        let (level, message, connection_id, fields) = &results[0];
        assert_eq!(level, "WARN");
        assert_eq!(message, "durability write failed");
        assert_eq!(connection_id.as_deref(), Some("conn_span"));
        assert!(fields.as_deref().unwrap_or_default().contains("\"sequence\":4"));
    }
}
