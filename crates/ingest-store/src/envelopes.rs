use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::instrument;

use ingest_core::{ConnectionId, EventEnvelope};

use crate::database::Database;
use crate::error::StoreError;

/// Row id of a stored envelope or dead letter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

/// A stored envelope row.
#[derive(Clone, Debug, Serialize)]
pub struct EnvelopeRow {
    pub id: RecordId,
    pub sender_id: ConnectionId,
    pub sequence: i64,
    pub payload: Vec<u8>,
    pub received_at: String,
    pub persisted_at: String,
}

/// An envelope whose durability write was given up on.
#[derive(Clone, Debug, Serialize)]
pub struct DeadLetterRow {
    pub id: RecordId,
    pub sender_id: ConnectionId,
    pub sequence: i64,
    pub payload: Vec<u8>,
    pub error: String,
    pub attempts: u32,
    pub failed_at: String,
}

pub struct EnvelopeRepo {
    db: Database,
}

impl EnvelopeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Durability write for one envelope, in its own transaction.
    /// On failure the transaction is rolled back and nothing is left behind.
    #[instrument(skip(self, envelope), fields(connection_id = %envelope.sender_id(), sequence = envelope.sequence()))]
    pub fn insert(&self, envelope: &EventEnvelope) -> Result<RecordId, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let written = tx.execute(
                "INSERT INTO envelopes (sender_id, sequence, payload, received_at, persisted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    envelope.sender_id().as_str(),
                    envelope.sequence() as i64,
                    envelope.payload().as_ref(),
                    envelope.received_at().to_rfc3339_opts(SecondsFormat::Micros, true),
                    now(),
                ],
            );

            match written {
                Ok(_) => {
                    let id = RecordId(tx.last_insert_rowid());
                    tx.commit()?;
                    Ok(id)
                }
                Err(e) => {
                    if let Err(rollback) = tx.rollback() {
                        tracing::error!(error = %rollback, "rollback failed");
                    }
                    Err(e.into())
                }
            }
        })
    }

    /// Record an envelope that could not be persisted.
    #[instrument(skip(self, envelope, error), fields(connection_id = %envelope.sender_id(), sequence = envelope.sequence()))]
    pub fn insert_dead_letter(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        attempts: u32,
    ) -> Result<RecordId, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dead_letters (sender_id, sequence, payload, error, attempts, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    envelope.sender_id().as_str(),
                    envelope.sequence() as i64,
                    envelope.payload().as_ref(),
                    error,
                    attempts,
                    now(),
                ],
            )?;
            Ok(RecordId(conn.last_insert_rowid()))
        })
    }

    /// Envelopes from one connection, in persistence order.
    #[instrument(skip(self), fields(connection_id = %sender_id))]
    pub fn list_for_sender(&self, sender_id: &ConnectionId) -> Result<Vec<EnvelopeRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, sequence, payload, received_at, persisted_at
                 FROM envelopes WHERE sender_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([sender_id.as_str()], |row| {
                    Ok(EnvelopeRow {
                        id: RecordId(row.get(0)?),
                        sender_id: ConnectionId::from_raw(row.get::<_, String>(1)?),
                        sequence: row.get(2)?,
                        payload: row.get(3)?,
                        received_at: row.get(4)?,
                        persisted_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_dead_letters(&self, sender_id: &ConnectionId) -> Result<Vec<DeadLetterRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, sequence, payload, error, attempts, failed_at
                 FROM dead_letters WHERE sender_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([sender_id.as_str()], |row| {
                    Ok(DeadLetterRow {
                        id: RecordId(row.get(0)?),
                        sender_id: ConnectionId::from_raw(row.get::<_, String>(1)?),
                        sequence: row.get(2)?,
                        payload: row.get(3)?,
                        error: row.get(4)?,
                        attempts: row.get(5)?,
                        failed_at: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Connections that have stored envelopes, oldest first.
    pub fn senders(&self) -> Result<Vec<ConnectionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sender_id FROM envelopes GROUP BY sender_id ORDER BY MIN(id) ASC",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|id| id.map(ConnectionId::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Total stored envelopes across all connections.
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM envelopes", [], |row| row.get(0))?))
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
