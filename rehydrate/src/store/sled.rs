//! A persistent [`EventLog`] implementation using `sled`.

use async_trait::async_trait;
use tracing::instrument;

use crate::{Error, EventLog, EventRecord, ExpectedRevision, RecordedEvent, Result};

/// A persistent, thread-safe event log using `sled`.
///
/// Each stream maps to its own `sled::Tree`, keyed by the big-endian bytes of
/// the revision so that a range scan yields events in revision order.
#[derive(Clone)]
pub struct SledEventLog {
    db: sled::Db,
}

impl SledEventLog {
    /// Creates a new `SledEventLog` over an open database.
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    fn open_tree(&self, stream_id: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(stream_id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))
    }
}

fn revision_key(revision: u64) -> [u8; 8] {
    revision.to_be_bytes()
}

fn revision_from_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Store("malformed revision key".to_owned()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl EventLog for SledEventLog {
    #[instrument(skip(self), fields(stream.id = %stream_id, from_revision))]
    async fn read_stream(
        &self,
        stream_id: &str,
        from_revision: u64,
    ) -> Result<Vec<RecordedEvent>> {
        let tree = self.open_tree(stream_id)?;
        // `open_tree` creates the tree, so emptiness is the "never written"
        // signal here.
        if tree.is_empty() {
            return Err(Error::StreamNotFound);
        }

        tree.range(revision_key(from_revision).as_slice()..)
            .map(|res| {
                let (k, v) = res.map_err(|e| Error::Store(e.to_string()))?;
                let revision = revision_from_key(&k)?;
                let event: EventRecord =
                    serde_json::from_slice(&v).map_err(|e| Error::Store(e.to_string()))?;
                Ok(RecordedEvent { revision, event })
            })
            .collect()
    }

    #[instrument(skip(self, events), fields(stream.id = %stream_id, ?expected, count = events.len()))]
    async fn append_to_stream(
        &self,
        stream_id: &str,
        events: Vec<EventRecord>,
        expected: ExpectedRevision,
    ) -> Result<u64> {
        let tree = self.open_tree(stream_id)?;

        let current = match tree.last().map_err(|e| Error::Store(e.to_string()))? {
            Some((k, _)) => Some(revision_from_key(&k)?),
            None => None,
        };
        let matches = match expected {
            ExpectedRevision::Any => true,
            ExpectedRevision::NoStream => current.is_none(),
            ExpectedRevision::Exact(revision) => current == Some(revision),
        };
        if !matches {
            return Err(Error::Conflict);
        }

        let next = current.map_or(0, |r| r + 1);
        let mut batch = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let value = serde_json::to_vec(event).map_err(|e| Error::Store(e.to_string()))?;
            batch.push((revision_key(next + offset as u64), value));
        }
        let last = match batch.last() {
            Some((key, _)) => revision_from_key(key)?,
            None => {
                return current
                    .ok_or_else(|| Error::Store("appended an empty batch to a new stream".to_owned()));
            }
        };

        tree.transaction(|tx| {
            for (key, value) in &batch {
                tx.insert(key.as_slice(), value.as_slice())?;
            }
            Ok(())
        })
        .map_err(|e: sled::transaction::TransactionError| Error::Store(e.to_string()))?;

        Ok(last)
    }
}
