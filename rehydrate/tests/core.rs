//! Integration tests for the rehydrate core components.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use rehydrate::{
    CloudEvent, Error, EventLog, EventRecord, ExpectedRevision, Result,
    migration::{Migration, MigrationChain},
    reconstructor::StreamReconstructor,
    snapshot::{Snapshot, SnapshotStream, should_snapshot},
    store::in_memory::InMemoryEventLog,
};

use chrono::Utc;
use cloudevents::AttributesReader;

/// Reducer state used for testing the reconstruction path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Account {
    balance: i64,
}

/// Minimal bank-account reducer: all domain rules live here, the runtime only
/// orders and feeds events.
fn apply_account(state: Option<Account>, record: EventRecord) -> Result<Account> {
    let amount = record.data["amount"].as_i64().unwrap_or(0);
    match (state, record.event_type.as_str()) {
        (None, "AccountOpened") => Ok(Account { balance: amount }),
        (Some(acc), "Deposited") => Ok(Account {
            balance: acc.balance + amount,
        }),
        (Some(acc), "Withdrawn") if acc.balance >= amount => Ok(Account {
            balance: acc.balance - amount,
        }),
        (Some(_), "Withdrawn") => Err(Error::DomainInvariant("insufficient balance".into())),
        (_, other) => Err(Error::DomainInvariant(format!(
            "unexpected event type {other}"
        ))),
    }
}

fn deposit(amount: i64) -> EventRecord {
    EventRecord::new("Deposited", 1, json!({ "amount": amount }))
}

/// Doubles the `value` field, v1 -> v2.
struct DoubleValue;

impl Migration for DoubleValue {
    fn event_type(&self) -> &'static str {
        "ValueSet"
    }

    fn from_version(&self) -> u16 {
        1
    }

    fn migrate(&self, data: Value) -> Result<Value> {
        let value = data["value"].as_i64().unwrap_or(0);
        Ok(json!({ "value": value * 2 }))
    }
}

/// Adds one to the `value` field, v2 -> v3.
struct IncrementValue;

impl Migration for IncrementValue {
    fn event_type(&self) -> &'static str {
        "ValueSet"
    }

    fn from_version(&self) -> u16 {
        2
    }

    fn migrate(&self, data: Value) -> Result<Value> {
        let value = data["value"].as_i64().unwrap_or(0);
        Ok(json!({ "value": value + 1 }))
    }
}

/// A broken migration that claims to stay on its own version.
struct StuckMigration;

impl Migration for StuckMigration {
    fn event_type(&self) -> &'static str {
        "ValueSet"
    }

    fn from_version(&self) -> u16 {
        1
    }

    fn to_version(&self) -> u16 {
        1
    }

    fn migrate(&self, data: Value) -> Result<Value> {
        Ok(data)
    }
}

// -- Event log ------------------------------------------------------------

#[test]
fn in_memory_log_append_and_read() {
    let log = InMemoryEventLog::new();

    let last = futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(100), deposit(200)],
        ExpectedRevision::NoStream,
    ))
    .expect("append should succeed");
    assert_eq!(last, 1, "two events take revisions 0 and 1");

    let recorded =
        futures::executor::block_on(log.read_stream("account-1", 0)).expect("read should succeed");
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].revision, 0);
    assert_eq!(recorded[1].revision, 1);
    assert_eq!(recorded[1].event.data["amount"], 200);
}

#[test]
fn in_memory_log_read_from_revision() {
    let log = InMemoryEventLog::new();
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(1), deposit(2), deposit(3)],
        ExpectedRevision::Any,
    ))
    .expect("append");

    let tail =
        futures::executor::block_on(log.read_stream("account-1", 2)).expect("read tail");
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].revision, 2);

    // Past the end of an existing stream is an empty read, not an error.
    let empty =
        futures::executor::block_on(log.read_stream("account-1", 10)).expect("read past end");
    assert!(empty.is_empty());
}

#[test]
fn in_memory_log_conflict_on_stale_revision() {
    let log = InMemoryEventLog::new();
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(1), deposit(2)],
        ExpectedRevision::Any,
    ))
    .expect("append");

    let err = futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(3)],
        ExpectedRevision::Exact(0),
    ))
    .expect_err("stale expected revision should conflict");
    assert!(matches!(err, Error::Conflict));

    // The stream is unchanged after the conflict.
    let recorded = futures::executor::block_on(log.read_stream("account-1", 0)).expect("read");
    assert_eq!(recorded.len(), 2);
}

#[test]
fn in_memory_log_no_stream_guard() {
    let log = InMemoryEventLog::new();
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(1)],
        ExpectedRevision::NoStream,
    ))
    .expect("first writer wins");

    let err = futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(2)],
        ExpectedRevision::NoStream,
    ))
    .expect_err("stream already exists");
    assert!(matches!(err, Error::Conflict));
}

#[test]
fn read_missing_stream_is_not_found() {
    let log = InMemoryEventLog::new();
    let err = futures::executor::block_on(log.read_stream("nope", 0))
        .expect_err("missing stream should be signalled");
    assert!(matches!(err, Error::StreamNotFound));
}

// -- Snapshots ------------------------------------------------------------

#[test]
fn snapshot_stream_save_and_latest() {
    let log = Arc::new(InMemoryEventLog::new());
    let snapshots = SnapshotStream::new(Arc::clone(&log));

    assert!(
        futures::executor::block_on(snapshots.latest("account-1"))
            .expect("no snapshot is not an error")
            .is_none()
    );

    for version in [5, 10] {
        let snapshot = Snapshot {
            state: json!({ "balance": version * 100 }),
            version,
            timestamp: Utc::now(),
        };
        futures::executor::block_on(snapshots.save("account-1", &snapshot)).expect("save");
    }

    let latest = futures::executor::block_on(snapshots.latest("account-1"))
        .expect("load")
        .expect("snapshot exists");
    assert_eq!(latest.version, 10, "newest snapshot wins");
    assert_eq!(latest.state["balance"], 1000);
}

#[test]
fn snapshot_cadence_predicate() {
    assert!(!should_snapshot(10, 0), "frequency 0 disables snapshots");
    assert!(!should_snapshot(0, 5));
    assert!(should_snapshot(5, 5));
    assert!(!should_snapshot(7, 5));
    assert!(should_snapshot(10, 5));
}

// -- Migrations -----------------------------------------------------------

#[test]
fn migration_chain_composes_versions() {
    let chain = MigrationChain::new()
        .with(DoubleValue)
        .with(IncrementValue)
        .with_current_version(3);

    let record = EventRecord::new("ValueSet", 1, json!({ "value": 5 }));
    let migrated = chain.apply(record).expect("migrations apply");
    assert_eq!(migrated.event_version, 3);
    assert_eq!(migrated.data["value"], 11, "(5 * 2) + 1");
}

#[test]
fn migration_chain_noop_on_current_event() {
    let chain = MigrationChain::new().with(DoubleValue).with(IncrementValue);

    let record = EventRecord::new("ValueSet", 3, json!({ "value": 11 }));
    let migrated = chain.apply(record.clone()).expect("no-op apply");
    assert_eq!(migrated, record, "an already-current event is untouched");
}

#[test]
fn migration_must_advance_version() {
    let chain = MigrationChain::new().with(StuckMigration);
    let record = EventRecord::new("ValueSet", 1, json!({ "value": 5 }));
    let err = chain.apply(record).expect_err("non-advancing migration");
    assert!(matches!(err, Error::Migration(_)));
}

#[test]
fn migrations_apply_during_replay() {
    let log = Arc::new(InMemoryEventLog::new());
    futures::executor::block_on(log.append_to_stream(
        "counter-1",
        vec![EventRecord::new("ValueSet", 1, json!({ "value": 5 }))],
        ExpectedRevision::Any,
    ))
    .expect("append v1 event");

    let reconstructor = StreamReconstructor::new(Arc::clone(&log)).with_migrations(
        MigrationChain::new().with(DoubleValue).with(IncrementValue),
    );

    let result = futures::executor::block_on(reconstructor.current_state(
        "counter-1",
        |_state: Option<i64>, record| Ok(record.data["value"].as_i64().unwrap_or(0)),
    ))
    .expect("reconstruct");
    assert_eq!(result.state, Some(11), "reducer sees the migrated payload");
    assert_eq!(result.version, 1);
}

// -- Reconstruction -------------------------------------------------------

#[test]
fn reconstruct_empty_stream_is_none_at_version_zero() {
    let log = Arc::new(InMemoryEventLog::new());
    let reconstructor = StreamReconstructor::new(log);

    let result =
        futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
            .expect("a never-written stream is not an error");
    assert_eq!(result.state, None);
    assert_eq!(result.version, 0);
}

#[test]
fn reconstruct_folds_events_in_order() {
    let log = Arc::new(InMemoryEventLog::new());
    let reconstructor = StreamReconstructor::new(Arc::clone(&log));

    futures::executor::block_on(async {
        reconstructor
            .append_event(
                "account-1",
                EventRecord::new("AccountOpened", 1, json!({ "amount": 1000 })),
                None,
            )
            .await?;
        reconstructor
            .append_event("account-1", deposit(500), None)
            .await?;
        reconstructor
            .append_event(
                "account-1",
                EventRecord::new("Withdrawn", 1, json!({ "amount": 200 })),
                None,
            )
            .await
    })
    .expect("append history");

    let result =
        futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
            .expect("reconstruct");
    assert_eq!(result.version, 3);
    assert_eq!(result.state.expect("account exists").balance, 1300);
}

#[test]
fn domain_invariant_rejected_before_append() {
    let log = Arc::new(InMemoryEventLog::new());
    let reconstructor = StreamReconstructor::new(Arc::clone(&log));

    futures::executor::block_on(async {
        reconstructor
            .append_event(
                "account-1",
                EventRecord::new("AccountOpened", 1, json!({ "amount": 1000 })),
                None,
            )
            .await?;
        reconstructor
            .append_event("account-1", deposit(500), None)
            .await?;
        reconstructor
            .append_event(
                "account-1",
                EventRecord::new("Withdrawn", 1, json!({ "amount": 200 })),
                None,
            )
            .await
    })
    .expect("append history");

    // Command handling: fold the current state, then run the candidate event
    // through the reducer before appending it.
    let current =
        futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
            .expect("reconstruct");
    let overdraw = EventRecord::new("Withdrawn", 1, json!({ "amount": 2000 }));
    let err = apply_account(current.state, overdraw).expect_err("overdraw is rejected");
    assert!(matches!(err, Error::DomainInvariant(_)));

    // Nothing was appended, so the stream version is unchanged.
    let after =
        futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
            .expect("reconstruct again");
    assert_eq!(after.version, 3);
    assert_eq!(after.state.expect("account exists").balance, 1300);
}

#[test]
fn reducer_error_aborts_reconstruction() {
    let log = Arc::new(InMemoryEventLog::new());
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![EventRecord::new("Exploded", 1, json!({}))],
        ExpectedRevision::Any,
    ))
    .expect("append");

    let reconstructor = StreamReconstructor::new(log);
    let err = futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
        .expect_err("reducer rejection propagates");
    assert!(matches!(err, Error::DomainInvariant(_)));
}

#[test]
fn snapshot_written_at_frequency_boundary() {
    let log = Arc::new(InMemoryEventLog::new());
    let reconstructor = StreamReconstructor::new(Arc::clone(&log)).with_snapshot_frequency(5);

    let mut events = vec![EventRecord::new(
        "AccountOpened",
        1,
        json!({ "amount": 1000 }),
    )];
    events.extend((0..4).map(|_| deposit(100)));
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        events,
        ExpectedRevision::NoStream,
    ))
    .expect("append five events");

    let result =
        futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
            .expect("reconstruct");
    assert_eq!(result.version, 5);

    let snapshot = futures::executor::block_on(reconstructor.latest_snapshot("account-1"))
        .expect("load snapshot")
        .expect("snapshot exists at the boundary");
    assert_eq!(snapshot.version, 5);

    // Two more events leave the version off the boundary; the old snapshot
    // stays the latest.
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(1), deposit(1)],
        ExpectedRevision::Exact(4),
    ))
    .expect("append tail");
    let result =
        futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
            .expect("reconstruct");
    assert_eq!(result.version, 7);
    let snapshot = futures::executor::block_on(reconstructor.latest_snapshot("account-1"))
        .expect("load snapshot")
        .expect("snapshot still exists");
    assert_eq!(snapshot.version, 5);
}

#[test]
fn snapshot_resume_skips_replayed_events() {
    let log = Arc::new(InMemoryEventLog::new());
    let reconstructor = StreamReconstructor::new(Arc::clone(&log)).with_snapshot_frequency(5);

    let mut events = vec![EventRecord::new(
        "AccountOpened",
        1,
        json!({ "amount": 1000 }),
    )];
    events.extend((0..4).map(|_| deposit(100)));
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        events,
        ExpectedRevision::NoStream,
    ))
    .expect("append five events");

    // First pass replays everything and persists a snapshot at version 5.
    let first =
        futures::executor::block_on(reconstructor.current_state("account-1", apply_account))
            .expect("first pass");

    // Second pass resumes from the snapshot; the reducer never runs.
    let mut calls = 0;
    let second = futures::executor::block_on(reconstructor.current_state(
        "account-1",
        |state, record| {
            calls += 1;
            apply_account(state, record)
        },
    ))
    .expect("second pass");
    assert_eq!(calls, 0, "all events were captured by the snapshot");
    assert_eq!(second, first, "resumed result equals the full replay");
}

#[test]
fn snapshot_does_not_change_result() {
    let log = Arc::new(InMemoryEventLog::new());
    let mut events = vec![EventRecord::new(
        "AccountOpened",
        1,
        json!({ "amount": 1000 }),
    )];
    events.extend((0..4).map(|_| deposit(100)));
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        events,
        ExpectedRevision::NoStream,
    ))
    .expect("append five events");

    let snapshotting = StreamReconstructor::new(Arc::clone(&log)).with_snapshot_frequency(5);
    // Warm pass to persist a snapshot, then extend the stream so the next
    // pass resumes mid-stream.
    futures::executor::block_on(snapshotting.current_state("account-1", apply_account))
        .expect("warm pass");
    futures::executor::block_on(log.append_to_stream(
        "account-1",
        vec![deposit(100), deposit(100)],
        ExpectedRevision::Exact(4),
    ))
    .expect("append tail");
    let resumed =
        futures::executor::block_on(snapshotting.current_state("account-1", apply_account))
            .expect("resumed pass");

    let plain = StreamReconstructor::new(Arc::clone(&log)).with_snapshot_suffix("-unused");
    let replayed =
        futures::executor::block_on(plain.current_state("account-1", apply_account))
            .expect("full replay");
    assert_eq!(resumed, replayed, "snapshots never change the outcome");
}

#[test]
fn append_event_checks_expected_revision() {
    let log = Arc::new(InMemoryEventLog::new());
    let reconstructor = StreamReconstructor::new(Arc::clone(&log));

    futures::executor::block_on(reconstructor.append_event(
        "account-1",
        EventRecord::new("AccountOpened", 1, json!({ "amount": 1000 })),
        None,
    ))
    .expect("unguarded append");

    let err = futures::executor::block_on(reconstructor.append_event(
        "account-1",
        deposit(500),
        Some(5),
    ))
    .expect_err("wrong revision conflicts");
    assert!(matches!(err, Error::Conflict));

    let last = futures::executor::block_on(reconstructor.append_event(
        "account-1",
        deposit(500),
        Some(0),
    ))
    .expect("matching revision appends");
    assert_eq!(last, 1);
}

// -- CloudEvents bridge ---------------------------------------------------

#[test]
fn cloudevent_from_record() {
    let record = EventRecord::new("AccountOpened", 1, json!({ "amount": 1000 }));
    let ce: CloudEvent = record.into();
    let inner = ce.into_inner();
    assert_eq!(inner.ty(), "AccountOpened");
    assert_eq!(inner.source().to_string(), "urn:rehydrate:event");
    assert!(!inner.id().is_empty(), "a fresh id is generated");
}
