//! Snapshotting: cached `(state, version)` pairs used to shortcut replay.
//!
//! Snapshots live in a derived, logically separate stream per aggregate
//! (`{stream_id}{suffix}`) inside the same event log. They are disposable and
//! non-authoritative: deleting every snapshot changes only the cost of
//! reconstruction, never its result.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::{Error, EventLog, EventRecord, ExpectedRevision, Result};

/// The default suffix appended to a stream id to form its snapshot stream.
pub const DEFAULT_SNAPSHOT_SUFFIX: &str = "-snapshot";

/// The event type under which snapshot records are appended.
const SNAPSHOT_EVENT_TYPE: &str = "snapshot";

/// A stored snapshot of reconstructed aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The aggregate state at `version`, kept as opaque structured data.
    pub state: Value,
    /// The number of events folded into `state`; also the revision to resume
    /// replay from.
    pub version: u64,
    /// When the snapshot was taken (ISO-8601 on the wire).
    pub timestamp: DateTime<Utc>,
}

/// Decides whether a reconstruction that reached `version` should persist a
/// new snapshot.
///
/// A `frequency` of 0 disables snapshotting entirely; every reconstruction
/// then replays from the beginning of the stream.
pub fn should_snapshot(version: u64, frequency: u64) -> bool {
    frequency > 0 && version > 0 && version % frequency == 0
}

/// Reads and writes the derived snapshot stream for aggregates.
///
/// Older snapshot records may remain in the underlying stream; only the last
/// record is ever read once a newer one exists.
pub struct SnapshotStream<L: EventLog> {
    log: Arc<L>,
    suffix: String,
}

impl<L: EventLog> SnapshotStream<L> {
    /// Creates a snapshot stream wrapper with the default suffix.
    pub fn new(log: Arc<L>) -> Self {
        Self {
            log,
            suffix: DEFAULT_SNAPSHOT_SUFFIX.to_owned(),
        }
    }

    /// Overrides the snapshot stream suffix.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    fn snapshot_stream_id(&self, stream_id: &str) -> String {
        format!("{stream_id}{}", self.suffix)
    }

    /// Loads the latest snapshot for a stream.
    ///
    /// A snapshot stream that has never been written is not an error; it
    /// means "no snapshot yet" and yields `None`.
    #[instrument(skip(self), fields(stream.id = %stream_id))]
    pub async fn latest(&self, stream_id: &str) -> Result<Option<Snapshot>> {
        let snapshot_stream = self.snapshot_stream_id(stream_id);
        let records = match self.log.read_stream(&snapshot_stream, 0).await {
            Ok(records) => records,
            Err(Error::StreamNotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        match records.last() {
            Some(recorded) => {
                let snapshot = serde_json::from_value(recorded.event.data.clone())
                    .map_err(|e| Error::Store(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Appends a new snapshot record for a stream.
    #[instrument(skip(self, snapshot), fields(stream.id = %stream_id, version = snapshot.version))]
    pub async fn save(&self, stream_id: &str, snapshot: &Snapshot) -> Result<()> {
        let snapshot_stream = self.snapshot_stream_id(stream_id);
        let data = serde_json::to_value(snapshot).map_err(|e| Error::Store(e.to_string()))?;
        let record = EventRecord::new(SNAPSHOT_EVENT_TYPE, 1, data);
        self.log
            .append_to_stream(&snapshot_stream, vec![record], ExpectedRevision::Any)
            .await?;
        Ok(())
    }
}
