use std::sync::Arc;

use async_trait::async_trait;

use ingest_core::EventEnvelope;

use crate::database::Database;
use crate::envelopes::{EnvelopeRepo, RecordId};
use crate::error::StoreError;

/// Durable, transactional destination for envelopes.
///
/// `insert` commits exactly one envelope or rolls it back; a failure must
/// leave the sink usable for the next call.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn insert(&self, envelope: &EventEnvelope) -> Result<RecordId, StoreError>;

    /// Park an envelope that exhausted its retries.
    async fn dead_letter(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        attempts: u32,
    ) -> Result<RecordId, StoreError>;
}

/// SQLite-backed sink. The connection is shared; each call runs on the
/// blocking pool so the runtime never waits on disk I/O.
#[derive(Clone)]
pub struct SqliteSink {
    repo: Arc<EnvelopeRepo>,
}

impl SqliteSink {
    pub fn new(db: Database) -> Self {
        Self {
            repo: Arc::new(EnvelopeRepo::new(db)),
        }
    }

    pub fn repo(&self) -> &EnvelopeRepo {
        &self.repo
    }
}

#[async_trait]
impl EnvelopeSink for SqliteSink {
    async fn insert(&self, envelope: &EventEnvelope) -> Result<RecordId, StoreError> {
        let repo = Arc::clone(&self.repo);
        let envelope = envelope.clone();
        tokio::task::spawn_blocking(move || repo.insert(&envelope))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn dead_letter(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        attempts: u32,
    ) -> Result<RecordId, StoreError> {
        let repo = Arc::clone(&self.repo);
        let envelope = envelope.clone();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || repo.insert_dead_letter(&envelope, &error, attempts))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::ConnectionId;

    #[tokio::test]
    async fn sqlite_sink_persists_through_blocking_pool() {
        let sink = SqliteSink::new(Database::in_memory().unwrap());
        let sender = ConnectionId::new();

        let first = sink
            .insert(&EventEnvelope::new(sender.clone(), 0, b"one".to_vec()))
            .await
            .unwrap();
        let second = sink
            .insert(&EventEnvelope::new(sender.clone(), 1, b"two".to_vec()))
            .await
            .unwrap();
        assert!(second > first);

        let rows = sink.repo().list_for_sender(&sender).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].payload, b"two");
    }

    #[tokio::test]
    async fn sqlite_sink_dead_letter() {
        let sink = SqliteSink::new(Database::in_memory().unwrap());
        let sender = ConnectionId::new();
        sink.dead_letter(&EventEnvelope::new(sender.clone(), 7, vec![1]), "boom", 2)
            .await
            .unwrap();

        let dead = sink.repo().list_dead_letters(&sender).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "boom");
    }

    #[tokio::test]
    async fn sink_is_usable_as_trait_object() {
        let sink: Arc<dyn EnvelopeSink> = Arc::new(SqliteSink::new(Database::in_memory().unwrap()));
        let id = sink
            .insert(&EventEnvelope::new(ConnectionId::new(), 0, vec![]))
            .await
            .unwrap();
        assert_eq!(id, RecordId(1));
    }
}
