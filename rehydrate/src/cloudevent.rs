//! CloudEvent conversion utilities.
//!
//! This module provides a lightweight [`CloudEvent`] newtype that wraps a
//! [`cloudevents_sdk::Event`] and a `From` implementation which turns an
//! [`EventRecord`] into a CloudEvent for downstream publication.
//!
//! # Example
//!
//! ```rust
//! use rehydrate::{EventRecord, cloudevent::CloudEvent};
//!
//! let record = EventRecord::new("AccountOpened", 1, serde_json::json!({ "amount": 1000 }));
//! let ce: CloudEvent = record.into();
//! ```
//!
//! A random UUID is generated for the CloudEvent `id` field and the `source`
//! attribute defaults to `"urn:rehydrate:event"`. If you need more control
//! use [`CloudEvent::from_record`] with an explicit source.

use crate::{Error, EventRecord, Result};
use cloudevents::event::{Data, Event as CeEvent, EventBuilder, EventBuilderV10};
use tracing::instrument;
use url::Url;
use uuid::Uuid;

const DEFAULT_SOURCE: &str = "urn:rehydrate:event";

/// Newtype wrapper around `cloudevents_sdk::Event` so we can legally provide
/// a [`From`] implementation without violating Rust's orphan rules.
#[derive(Debug, Clone)]
pub struct CloudEvent(pub CeEvent);

impl CloudEvent {
    /// Returns the inner [`cloudevents_sdk::Event`].
    #[must_use]
    pub fn into_inner(self) -> CeEvent {
        self.0
    }

    /// Builds a [`CloudEvent`] from an [`EventRecord`] and an explicit
    /// [`Url`] source.
    #[instrument(skip(record), fields(event.r#type = %record.event_type))]
    pub fn from_record(record: &EventRecord, source: Url) -> Result<Self> {
        let id = Uuid::new_v4().to_string();

        let ce = EventBuilderV10::new()
            .id(id)
            .ty(record.event_type.clone())
            .source(source)
            .data("application/json", Data::from(record.data.clone()))
            .build()
            .map_err(|e| Error::Store(format!("failed to build CloudEvent: {e}")))?;

        Ok(Self(ce))
    }
}

impl From<EventRecord> for CloudEvent {
    fn from(record: EventRecord) -> Self {
        let source = Url::parse(DEFAULT_SOURCE).expect("default URN is valid");

        // Safe expect: the builder only fails on missing attributes, and all
        // are supplied above.
        Self::from_record(&record, source).expect("constructing CloudEvent cannot fail")
    }
}
