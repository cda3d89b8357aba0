//! An in-memory event log, useful for testing and development.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use crate::{Error, EventLog, EventRecord, ExpectedRevision, RecordedEvent, Result};

/// Thread-safe map keyed by stream id.
type StreamMap = DashMap<String, Vec<RecordedEvent>>;

/// An in-memory, thread-safe event log.
///
/// This is useful for testing or for applications that do not require a
/// persistent event log. Streams are plain vectors, the index within a
/// vector is the event's revision.
#[derive(Default)]
pub struct InMemoryEventLog {
    streams: StreamMap,
}

impl InMemoryEventLog {
    /// Creates a new, empty event log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    #[instrument(skip(self), fields(stream.id = %stream_id, from_revision))]
    async fn read_stream(
        &self,
        stream_id: &str,
        from_revision: u64,
    ) -> Result<Vec<RecordedEvent>> {
        match self.streams.get(stream_id) {
            // An entry can exist with no events (an append that conflicted on
            // a fresh entry); it still counts as never written.
            Some(stream) if !stream.is_empty() => Ok(stream
                .iter()
                .filter(|e| e.revision >= from_revision)
                .cloned()
                .collect()),
            _ => Err(Error::StreamNotFound),
        }
    }

    #[instrument(skip(self, events), fields(stream.id = %stream_id, ?expected, count = events.len()))]
    async fn append_to_stream(
        &self,
        stream_id: &str,
        events: Vec<EventRecord>,
        expected: ExpectedRevision,
    ) -> Result<u64> {
        let mut stream = self.streams.entry(stream_id.to_owned()).or_default();

        let current = stream.last().map(|e| e.revision);
        let matches = match expected {
            ExpectedRevision::Any => true,
            ExpectedRevision::NoStream => current.is_none(),
            ExpectedRevision::Exact(revision) => current == Some(revision),
        };
        if !matches {
            return Err(Error::Conflict);
        }

        let mut revision = current.map_or(0, |r| r + 1);
        for event in events {
            stream.push(RecordedEvent { revision, event });
            revision += 1;
        }

        stream
            .last()
            .map(|e| e.revision)
            .ok_or_else(|| Error::Store("appended an empty batch to a new stream".to_owned()))
    }
}
