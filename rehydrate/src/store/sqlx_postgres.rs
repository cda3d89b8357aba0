//! A `sqlx` implementation of the event log for PostgreSQL.
//!
//! Compile it with the `postgres-storage` cargo feature.
#![allow(clippy::missing_errors_doc)]

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use crate::{Error, EventLog, EventRecord, ExpectedRevision, RecordedEvent, Result};

/// Maps `sqlx::Error` into this crate's `Error`.
fn to_store_error(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

/// A `sqlx`-backed event log for PostgreSQL.
///
/// All streams share one `events` table keyed by `(stream_id, revision)`; the
/// primary key doubles as the uniqueness guard behind the optimistic
/// concurrency check.
#[derive(Debug, Clone)]
pub struct SqlxEventLog {
    pool: PgPool,
}

impl SqlxEventLog {
    /// Creates a new `SqlxEventLog`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the `events` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS events (
                    stream_id TEXT NOT NULL,
                    revision BIGINT NOT NULL,
                    event_type TEXT NOT NULL,
                    event_version SMALLINT NOT NULL,
                    data JSONB NOT NULL,
                    metadata JSONB,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (stream_id, revision)
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventLog for SqlxEventLog {
    #[instrument(skip(self), fields(stream.id = %stream_id, from_revision))]
    async fn read_stream(
        &self,
        stream_id: &str,
        from_revision: u64,
    ) -> Result<Vec<RecordedEvent>> {
        let rows: Vec<(i64, String, i16, serde_json::Value, Option<serde_json::Value>)> =
            sqlx::query_as(
                "SELECT revision, event_type, event_version, data, metadata \
                 FROM events WHERE stream_id = $1 AND revision >= $2 ORDER BY revision",
            )
            .bind(stream_id)
            .bind(from_revision as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(to_store_error)?;

        if rows.is_empty() {
            // Distinguish "never written" from "no events at or after the
            // requested revision".
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM events WHERE stream_id = $1 LIMIT 1")
                    .bind(stream_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(to_store_error)?;
            if exists.is_none() {
                return Err(Error::StreamNotFound);
            }
        }

        Ok(rows
            .into_iter()
            .map(
                |(revision, event_type, event_version, data, metadata)| RecordedEvent {
                    revision: revision as u64,
                    event: EventRecord {
                        event_type,
                        event_version: event_version as u16,
                        data,
                        metadata,
                    },
                },
            )
            .collect())
    }

    #[instrument(skip(self, events), fields(stream.id = %stream_id, ?expected, count = events.len()))]
    async fn append_to_stream(
        &self,
        stream_id: &str,
        events: Vec<EventRecord>,
        expected: ExpectedRevision,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(to_store_error)?;

        // Optimistic concurrency check.
        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(revision) FROM events WHERE stream_id = $1")
                .bind(stream_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(to_store_error)?;

        let matches = match expected {
            ExpectedRevision::Any => true,
            ExpectedRevision::NoStream => current.is_none(),
            ExpectedRevision::Exact(revision) => current == Some(revision as i64),
        };
        if !matches {
            return Err(Error::Conflict);
        }

        let next = current.map_or(0, |r| r + 1);
        let revisions: Vec<i64> = (0..events.len() as i64).map(|i| next + i).collect();
        let last = match revisions.last() {
            Some(last) => *last as u64,
            None => {
                return current.map(|r| r as u64).ok_or_else(|| {
                    Error::Store("appended an empty batch to a new stream".to_owned())
                });
            }
        };

        let event_types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        let event_versions: Vec<i16> = events.iter().map(|e| e.event_version as i16).collect();
        let payloads: Vec<serde_json::Value> = events.iter().map(|e| e.data.clone()).collect();
        let metadata: Vec<Option<serde_json::Value>> =
            events.iter().map(|e| e.metadata.clone()).collect();

        // Bulk insert.
        sqlx::query(
            r#"
            INSERT INTO events (stream_id, revision, event_type, event_version, data, metadata)
            SELECT $1, r, t, ev, d, m
            FROM UNNEST($2::BIGINT[], $3::TEXT[], $4::SMALLINT[], $5::JSONB[], $6::JSONB[])
                AS x(r, t, ev, d, m)
            "#,
        )
        .bind(stream_id)
        .bind(&revisions)
        .bind(&event_types)
        .bind(&event_versions)
        .bind(&payloads)
        .bind(&metadata)
        .execute(&mut *tx)
        .await
        .map_err(to_store_error)?;

        tx.commit().await.map_err(to_store_error)?;

        Ok(last)
    }
}
