//! # Rehydrate
//!
//! `rehydrate` is an event-sourcing persistence runtime layered over an
//! append-only, revision-ordered event log with optimistic concurrency
//! control. It reconstructs aggregate state from a stream of versioned
//! events, accelerates reconstruction via periodic snapshots, transparently
//! upgrades older event shapes via chained migrations, and coordinates
//! best-effort writes that span an aggregate root's stream and the streams of
//! entities it references.
//!
//! ## Core Concepts
//!
//! - **[`EventLog`]**: the append-only, per-stream log the runtime is layered
//!   over. Reference backends live in [`store`].
//! - **[`EventRecord`]**: an immutable, versioned event with an opaque JSON
//!   payload.
//! - **[`reconstructor::StreamReconstructor`]**: folds a stream into caller
//!   state via a reducer, shortcutting replay through snapshots.
//! - **[`migration::MigrationChain`]**: upgrades older event shapes to the
//!   current version during replay.
//! - **[`transaction::TransactionCoordinator`]**: batches events for an
//!   aggregate root and its dependent entity streams behind
//!   begin/add/commit/rollback semantics.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rehydrate::{Error, EventRecord, Result};
//! use rehydrate::reconstructor::{ReconstructedState, StreamReconstructor};
//! use rehydrate::store::in_memory::InMemoryEventLog;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Account {
//!     balance: i64,
//! }
//!
//! /// The reducer owns all domain rules; the runtime only orders and feeds
//! /// events into it.
//! fn apply_account(state: Option<Account>, record: EventRecord) -> Result<Account> {
//!     let amount = record.data["amount"].as_i64().unwrap_or(0);
//!     match (state, record.event_type.as_str()) {
//!         (None, "AccountOpened") => Ok(Account { balance: amount }),
//!         (None, _) => Err(Error::DomainInvariant(
//!             "first event must open the account".into(),
//!         )),
//!         (Some(_), "AccountOpened") => {
//!             Err(Error::DomainInvariant("account already open".into()))
//!         }
//!         (Some(acc), "Deposited") => Ok(Account {
//!             balance: acc.balance + amount,
//!         }),
//!         (Some(acc), "Withdrawn") if acc.balance >= amount => Ok(Account {
//!             balance: acc.balance - amount,
//!         }),
//!         (Some(_), "Withdrawn") => Err(Error::DomainInvariant("insufficient balance".into())),
//!         (Some(_), other) => Err(Error::DomainInvariant(format!(
//!             "unknown event type {other}"
//!         ))),
//!     }
//! }
//!
//! async fn bank_account_example() -> Result<()> {
//!     let log = Arc::new(InMemoryEventLog::default());
//!     let reconstructor = StreamReconstructor::new(log).with_snapshot_frequency(100);
//!
//!     let opened = EventRecord::new("AccountOpened", 1, serde_json::json!({ "amount": 1000 }));
//!     reconstructor.append_event("account-1", opened, None).await?;
//!
//!     let ReconstructedState { state, version } = reconstructor
//!         .current_state("account-1", apply_account)
//!         .await?;
//!     assert_eq!(version, 1);
//!     assert_eq!(state.expect("account exists").balance, 1000);
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

use std::fmt::Debug;

pub use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod cloudevent;
pub mod migration;
pub mod reconstructor;
pub mod snapshot;
pub mod store;
pub mod transaction;

pub use cloudevent::CloudEvent;

/// The error type for this crate.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// Occurs when an append's expected revision does not match the stream's
    /// actual revision, indicating a concurrency conflict. Never retried by
    /// this layer.
    #[error("concurrency conflict")]
    Conflict,
    /// Occurs when a stream has never been written. The reconstruction path
    /// converts this into `{state: None, version: 0}`; raw log reads surface
    /// it verbatim.
    #[error("stream not found")]
    StreamNotFound,
    /// Wraps an error from the underlying event log, including
    /// (de)serialization failures.
    #[error("event log error: {0}")]
    Store(String),
    /// Occurs when an event migration fails or would not advance the event's
    /// version. Aborts the whole reconstruction.
    #[error("migration error: {0}")]
    Migration(String),
    /// Occurs when the caller's reducer rejects an event on business-rule
    /// grounds. Propagates unmodified.
    #[error("domain invariant violated: {0}")]
    DomainInvariant(String),
    /// Occurs when `add_event` or `commit_transaction` is called for an
    /// aggregate id without a prior `begin_transaction`.
    #[error("no active transaction for aggregate '{0}'")]
    NoActiveTransaction(String),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An immutable, versioned event as written to (and read from) the log.
///
/// `event_type` selects the reducer branch; `event_version` selects the
/// migration entry point. The payload stays opaque structured data at this
/// layer and is decoded into concrete types only inside reducers and
/// migrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The type of the event.
    pub event_type: String,
    /// The version of the event's schema.
    pub event_version: u16,
    /// The event payload itself.
    pub data: Value,
    /// Optional caller-defined metadata carried alongside the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl EventRecord {
    /// Creates a new event record without metadata.
    pub fn new(event_type: impl Into<String>, event_version: u16, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_version,
            data,
            metadata: None,
        }
    }

    /// Attaches metadata to the record.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An event together with the zero-based revision the log assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// The zero-based position of the event within its stream.
    pub revision: u64,
    /// The event itself.
    pub event: EventRecord,
}

/// The optimistic concurrency guard for [`EventLog::append_to_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// No guard; the append succeeds regardless of the stream's revision.
    Any,
    /// The stream must not exist (or hold no events) yet.
    NoStream,
    /// The stream's last revision must equal the given value.
    Exact(u64),
}

/// A typed domain event that knows how to describe and serialize itself.
///
/// Implement this on caller event enums (or use `#[derive(DomainEvent)]` from
/// `rehydrate-derive`) to build [`EventRecord`]s without hand-writing type
/// tags.
pub trait DomainEvent: Serialize + Clone + Debug + Send + Sync {
    /// Returns a static string slice representing the type of the event.
    fn event_type(&self) -> &'static str;

    /// Returns the version of the event's schema. Defaults to `1`.
    fn event_version(&self) -> u16 {
        1
    }

    /// Serializes the event into an [`EventRecord`] ready for appending.
    fn to_record(&self) -> Result<EventRecord> {
        let data = serde_json::to_value(self).map_err(|e| Error::Store(e.to_string()))?;
        Ok(EventRecord::new(
            self.event_type(),
            self.event_version(),
            data,
        ))
    }
}

/// The append-only, revision-ordered event log this runtime is layered over.
///
/// The log is an external collaborator: it owns durability, replication and
/// indexing. This crate only requires the two operations below, plus the
/// distinguished [`Error::StreamNotFound`] signal for streams that have never
/// been written.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Reads all events of a stream from `from_revision` (inclusive) forward,
    /// in revision order, terminating at the current stream end.
    ///
    /// Returns [`Error::StreamNotFound`] for a stream that has never been
    /// written. A stream that exists but holds no events at or after
    /// `from_revision` yields an empty vector.
    async fn read_stream(
        &self,
        stream_id: &str,
        from_revision: u64,
    ) -> Result<Vec<RecordedEvent>>;

    /// Appends a batch of events to a stream, guarded by `expected`.
    ///
    /// The batch is assigned consecutive revisions. Returns the stream's last
    /// committed revision after the append, or [`Error::Conflict`] when the
    /// guard does not hold.
    async fn append_to_stream(
        &self,
        stream_id: &str,
        events: Vec<EventRecord>,
        expected: ExpectedRevision,
    ) -> Result<u64>;
}
