//! Reference [`crate::EventLog`] backends.
//!
//! Snapshots are stored as derived streams inside the same log, so a backend
//! only ever implements the one trait; there is no separate snapshot store.

// The in-memory implementation is compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory event log.
pub mod in_memory;

// The persistent `sled` implementation is compiled when the `sled-storage`
// feature is enabled.
#[cfg(feature = "sled-storage")]
/// A persistent event log using `sled`.
pub mod sled;

// SQLx / Postgres implementation compiled when the `postgres-storage` feature
// is enabled.
#[cfg(feature = "postgres-storage")]
pub mod sqlx_postgres;
