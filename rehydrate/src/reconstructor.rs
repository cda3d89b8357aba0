//! Reconstructs aggregate state by folding a stream through a caller reducer.
use std::sync::Arc;

use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use tracing::instrument;

use crate::{
    Error, EventLog, EventRecord, ExpectedRevision, Result,
    migration::MigrationChain,
    snapshot::{Snapshot, SnapshotStream, should_snapshot},
};

/// The outcome of a reconstruction pass.
///
/// `state: None, version: 0` is the canonical "stream does not exist" signal,
/// returned without error for never-written streams.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedState<S> {
    /// The folded aggregate state, or `None` for an empty stream.
    pub state: Option<S>,
    /// The number of events folded into `state`, counting those captured by
    /// the snapshot the replay resumed from.
    pub version: u64,
}

/// Orchestrates snapshot lookup, event replay, migration and folding.
///
/// The reconstructor owns the read path: it never mutates caller state in
/// place, and it advances the version counter only inside the fold step.
/// Snapshot logic reads that counter, it never recomputes one.
pub struct StreamReconstructor<L: EventLog> {
    log: Arc<L>,
    snapshots: SnapshotStream<L>,
    migrations: MigrationChain,
    snapshot_frequency: u64,
}

impl<L: EventLog> StreamReconstructor<L> {
    /// Creates a reconstructor over the given log with snapshotting disabled
    /// and an empty migration chain.
    pub fn new(log: Arc<L>) -> Self {
        Self {
            snapshots: SnapshotStream::new(Arc::clone(&log)),
            log,
            migrations: MigrationChain::new(),
            snapshot_frequency: 0,
        }
    }

    /// Sets the migration chain applied to every replayed event.
    #[must_use]
    pub fn with_migrations(mut self, migrations: MigrationChain) -> Self {
        self.migrations = migrations;
        self
    }

    /// Sets the snapshot cadence: a snapshot is persisted whenever a
    /// reconstruction pass ends on a positive multiple of `frequency`.
    ///
    /// A frequency of 0 (the default) disables snapshotting; every
    /// reconstruction then replays the stream from its beginning.
    #[must_use]
    pub fn with_snapshot_frequency(mut self, frequency: u64) -> Self {
        self.snapshot_frequency = frequency;
        self
    }

    /// Overrides the suffix naming the derived snapshot stream.
    #[must_use]
    pub fn with_snapshot_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.snapshots = self.snapshots.with_suffix(suffix);
        self
    }

    /// Reconstructs the current state of a stream.
    ///
    /// The replay starts from the latest snapshot when one exists, otherwise
    /// from the beginning of the stream. Each event passes through the
    /// migration chain before the caller's reducer folds it in; the version
    /// counter advances by exactly one per applied event.
    ///
    /// Reducer errors propagate unmodified and abort the reconstruction; no
    /// partial state is returned. Snapshot persistence failures are logged
    /// and swallowed: the snapshot is an optimization, never a correctness
    /// dependency.
    #[instrument(skip(self, apply), fields(stream.id = %stream_id))]
    pub async fn current_state<S, F>(
        &self,
        stream_id: &str,
        mut apply: F,
    ) -> Result<ReconstructedState<S>>
    where
        S: Serialize + DeserializeOwned,
        F: FnMut(Option<S>, EventRecord) -> Result<S>,
    {
        let (mut state, mut version) = match self.snapshots.latest(stream_id).await? {
            Some(snapshot) => {
                let state: S = serde_json::from_value(snapshot.state)
                    .map_err(|e| Error::Store(e.to_string()))?;
                (Some(state), snapshot.version)
            }
            None => (None, 0),
        };
        let replay_from = version;

        let records = match self.log.read_stream(stream_id, replay_from).await {
            Ok(records) => records,
            // A never-written stream is the canonical "does not exist"
            // signal, not an error, on this path.
            Err(Error::StreamNotFound) => Vec::new(),
            Err(e) => return Err(e),
        };

        for recorded in records {
            let migrated = self.migrations.apply(recorded.event)?;
            state = Some(apply(state, migrated)?);
            version += 1;
        }

        if version > replay_from && should_snapshot(version, self.snapshot_frequency) {
            self.persist_snapshot(stream_id, state.as_ref(), version)
                .await;
        }

        Ok(ReconstructedState { state, version })
    }

    /// Writes one event to a stream, optionally guarded by an
    /// expected-revision optimistic-concurrency check.
    ///
    /// On mismatch the log signals [`Error::Conflict`], which is surfaced
    /// verbatim; this layer never retries.
    #[instrument(skip(self, event), fields(stream.id = %stream_id, event.r#type = %event.event_type))]
    pub async fn append_event(
        &self,
        stream_id: &str,
        event: EventRecord,
        expected_revision: Option<u64>,
    ) -> Result<u64> {
        let expected = match expected_revision {
            Some(revision) => ExpectedRevision::Exact(revision),
            None => ExpectedRevision::Any,
        };
        self.log
            .append_to_stream(stream_id, vec![event], expected)
            .await
    }

    /// Loads the latest snapshot for a stream, or `None` when no snapshot
    /// has been taken yet.
    pub async fn latest_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>> {
        self.snapshots.latest(stream_id).await
    }

    async fn persist_snapshot<S: Serialize>(
        &self,
        stream_id: &str,
        state: Option<&S>,
        version: u64,
    ) {
        let Some(state) = state else { return };
        let value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(stream.id = %stream_id, version, error = %e,
                    "snapshot serialization failed; continuing without snapshot");
                return;
            }
        };
        let snapshot = Snapshot {
            state: value,
            version,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.snapshots.save(stream_id, &snapshot).await {
            tracing::warn!(stream.id = %stream_id, version, error = %e,
                "snapshot write failed; continuing without snapshot");
        }
    }
}
