//! Defines the migration mechanism for handling event schema versioning.
use serde_json::Value;

use crate::{Error, EventRecord, Result};

/// Defines the interface for a single event migration.
///
/// A migration is responsible for transforming an event payload from an older
/// schema version to the next one. Migrations must be pure: given the same
/// input they always produce the same output, with no side effects and no I/O.
pub trait Migration: Send + Sync {
    /// The type of event this migration can handle.
    fn event_type(&self) -> &'static str;

    /// The schema version this migration transforms from.
    fn from_version(&self) -> u16;

    /// The schema version this migration transforms to.
    ///
    /// Must be strictly greater than [`Migration::from_version`]; the chain
    /// aborts replay otherwise, since a non-advancing migration would loop
    /// forever.
    fn to_version(&self) -> u16 {
        self.from_version() + 1
    }

    /// Transforms a JSON payload of an event into its next version.
    fn migrate(&self, data: Value) -> Result<Value>;
}

/// An ordered set of migrations applied sequentially during replay.
///
/// The chain is keyed by `(event_type, from_version)`. Multiple migrations for
/// the same event type at different `from_version` values compose
/// automatically within one replay pass: a v1 event passes through 1→2 and
/// 2→3 before it reaches the reducer.
#[derive(Default)]
pub struct MigrationChain {
    migrations: Vec<Box<dyn Migration>>,
    current_version: Option<u16>,
}

impl MigrationChain {
    /// Creates a new, empty migration chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a migration to the chain.
    #[must_use]
    pub fn with<M: Migration + 'static>(mut self, migration: M) -> Self {
        self.migrations.push(Box::new(migration));
        self
    }

    /// Records the current event schema version for the application.
    ///
    /// Purely diagnostic: an event left below this version after the chain
    /// runs is logged at debug level, since it usually means a migration is
    /// missing from the chain.
    #[must_use]
    pub fn with_current_version(mut self, version: u16) -> Self {
        self.current_version = Some(version);
        self
    }

    /// Applies the migration chain to an event record.
    ///
    /// Repeatedly looks up a migration matching the record's
    /// `(event_type, event_version)` and replaces the payload until no further
    /// migration matches. Idempotent on an already-current event: no match
    /// means no-op.
    ///
    /// A failing migration aborts the whole replay; partial migration is not
    /// a valid state.
    pub fn apply(&self, mut record: EventRecord) -> Result<EventRecord> {
        while let Some(migration) = self.migrations.iter().find(|m| {
            m.event_type() == record.event_type && m.from_version() == record.event_version
        }) {
            if migration.to_version() <= record.event_version {
                return Err(Error::Migration(format!(
                    "migration for '{}' v{} does not advance the version",
                    record.event_type, record.event_version
                )));
            }
            record.data = migration.migrate(record.data)?;
            record.event_version = migration.to_version();
        }

        if let Some(current) = self.current_version {
            if record.event_version < current {
                tracing::debug!(
                    event_type = %record.event_type,
                    event_version = record.event_version,
                    current_version = current,
                    "event left below current version; no matching migration"
                );
            }
        }

        Ok(record)
    }

    /// Returns `true` when the chain holds no migrations.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
