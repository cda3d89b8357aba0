//! Batches events for an aggregate root and its dependent entity streams.
//!
//! The coordinator provides begin/add/commit/rollback semantics around the
//! event log. Commit is "best-effort sequential", not "all-or-nothing": each
//! referenced entity stream receives its copy in turn, then the aggregate
//! root receives the full batch. A failure mid-commit discards the in-memory
//! pending state but does not undo writes that already happened; callers
//! must treat entity-stream writes as idempotent or tolerant of duplication
//! on retry.
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{Error, EventLog, EventRecord, ExpectedRevision, Result};

/// A pointer from an aggregate-scoped event to a dependent stream that should
/// also observe that event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    /// The dependent entity's id.
    pub id: String,
    /// The dependent entity's type, used to resolve its stream name.
    pub entity_type: String,
    /// The entity's expected current version (event count) at commit time.
    ///
    /// The coordinator records this claim without validating it; the log's
    /// expected-revision check enforces it when the copy is appended.
    pub version: u64,
}

/// Controls how aggregate ids and entity refs map onto stream ids.
#[derive(Debug, Clone, Default)]
pub struct StreamNaming {
    aggregate_prefix: String,
    entity_prefixes: HashMap<String, String>,
}

impl StreamNaming {
    /// Creates a naming scheme with no aggregate prefix and per-type entity
    /// prefixes defaulting to `{entity_type}-`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prefix prepended to aggregate ids.
    #[must_use]
    pub fn with_aggregate_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.aggregate_prefix = prefix.into();
        self
    }

    /// Sets the stream prefix for one entity type.
    #[must_use]
    pub fn with_entity_prefix(
        mut self,
        entity_type: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        self.entity_prefixes.insert(entity_type.into(), prefix.into());
        self
    }

    /// Resolves the stream id for an aggregate root.
    pub fn aggregate_stream_id(&self, aggregate_id: &str) -> String {
        format!("{}{aggregate_id}", self.aggregate_prefix)
    }

    /// Resolves the stream id for a dependent entity.
    pub fn entity_stream_id(&self, entity_type: &str, entity_id: &str) -> String {
        match self.entity_prefixes.get(entity_type) {
            Some(prefix) => format!("{prefix}{entity_id}"),
            None => format!("{entity_type}-{entity_id}"),
        }
    }
}

struct PendingEvent {
    event: EventRecord,
    entity_refs: Vec<EntityRef>,
}

#[derive(Default)]
struct PendingTransaction {
    events: Vec<PendingEvent>,
    entity_versions: HashMap<String, u64>,
}

/// Coordinates multi-stream writes behind per-aggregate transactions.
///
/// The transaction state is ephemeral and in-memory, keyed by aggregate id.
/// Key presence is the state machine: a key in the map means OPEN, absence
/// means NO_TRANSACTION. The map gives batching convenience, not mutual
/// exclusion; concurrent `add_event`/`commit_transaction` calls against the
/// same aggregate id must be serialized by the caller.
pub struct TransactionCoordinator<L: EventLog> {
    log: Arc<L>,
    naming: StreamNaming,
    pending: DashMap<String, PendingTransaction>,
}

impl<L: EventLog> TransactionCoordinator<L> {
    /// Creates a coordinator over the given log with default stream naming.
    pub fn new(log: Arc<L>) -> Self {
        Self {
            log,
            naming: StreamNaming::new(),
            pending: DashMap::new(),
        }
    }

    /// Overrides the stream naming scheme.
    #[must_use]
    pub fn with_naming(mut self, naming: StreamNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Opens a transaction for an aggregate id, resetting any pending events
    /// from a previous unfinished transaction for the same id (last call
    /// wins).
    #[instrument(skip(self), fields(aggregate.id = %aggregate_id))]
    pub fn begin_transaction(&self, aggregate_id: &str) {
        self.pending
            .insert(aggregate_id.to_owned(), PendingTransaction::default());
    }

    /// Queues an event for the aggregate's stream and, through `entity_refs`,
    /// for the streams of the entities it references.
    ///
    /// Each ref's claimed version is recorded in-memory, last write per
    /// entity id wins. Fails with [`Error::NoActiveTransaction`] when no
    /// transaction is open for the aggregate id.
    #[instrument(skip(self, event, entity_refs), fields(aggregate.id = %aggregate_id, event.r#type = %event.event_type))]
    pub fn add_event(
        &self,
        aggregate_id: &str,
        event: EventRecord,
        entity_refs: Vec<EntityRef>,
    ) -> Result<()> {
        let mut transaction = self
            .pending
            .get_mut(aggregate_id)
            .ok_or_else(|| Error::NoActiveTransaction(aggregate_id.to_owned()))?;
        for entity_ref in &entity_refs {
            transaction
                .entity_versions
                .insert(entity_ref.id.clone(), entity_ref.version);
        }
        transaction.events.push(PendingEvent { event, entity_refs });
        Ok(())
    }

    /// Writes the pending batch: per event, a copy to every referenced
    /// entity stream, then the full batch to the aggregate root stream.
    ///
    /// The pending state is discarded before the first write, so a failed
    /// commit is an implicit rollback; writes already performed are not
    /// undone. An open transaction with no pending events commits as a
    /// no-op. Committing without an open transaction fails with
    /// [`Error::NoActiveTransaction`], which also covers re-committing an
    /// already resolved transaction.
    #[instrument(skip(self), fields(aggregate.id = %aggregate_id))]
    pub async fn commit_transaction(&self, aggregate_id: &str) -> Result<()> {
        let (_, transaction) = self
            .pending
            .remove(aggregate_id)
            .ok_or_else(|| Error::NoActiveTransaction(aggregate_id.to_owned()))?;

        if transaction.events.is_empty() {
            return Ok(());
        }

        // Expectation per entity stream: the last claimed version, advanced
        // by however many copies this commit already appended to it.
        let mut appended: HashMap<String, u64> = HashMap::new();
        for pending in &transaction.events {
            for entity_ref in &pending.entity_refs {
                let stream_id = self
                    .naming
                    .entity_stream_id(&entity_ref.entity_type, &entity_ref.id);
                let claimed = transaction
                    .entity_versions
                    .get(&entity_ref.id)
                    .copied()
                    .unwrap_or(entity_ref.version);
                let prior = appended.get(&entity_ref.id).copied().unwrap_or(0);
                let expected = match claimed + prior {
                    0 => ExpectedRevision::NoStream,
                    version => ExpectedRevision::Exact(version - 1),
                };
                self.log
                    .append_to_stream(&stream_id, vec![pending.event.clone()], expected)
                    .await?;
                *appended.entry(entity_ref.id.clone()).or_insert(0) += 1;
            }
        }

        let root_stream = self.naming.aggregate_stream_id(aggregate_id);
        let batch: Vec<EventRecord> = transaction.events.into_iter().map(|p| p.event).collect();
        self.log
            .append_to_stream(&root_stream, batch, ExpectedRevision::Any)
            .await?;
        Ok(())
    }

    /// Discards the pending events and entity-version claims for an
    /// aggregate id without writing anything. Always succeeds, even when no
    /// transaction is open.
    #[instrument(skip(self), fields(aggregate.id = %aggregate_id))]
    pub fn rollback_transaction(&self, aggregate_id: &str) {
        self.pending.remove(aggregate_id);
    }

    /// Returns `true` while a transaction is open for the aggregate id.
    pub fn has_active_transaction(&self, aggregate_id: &str) -> bool {
        self.pending.contains_key(aggregate_id)
    }
}
