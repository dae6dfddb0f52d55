//! The event store port.
//!
//! Backends implement [`EventStore`]; the in-memory reference backend lives
//! in the `keystone-memory` crate. The contract every backend must honour:
//!
//! - `save_events` checks the aggregate's current version against
//!   `expected_version` and appends atomically with that check. On mismatch
//!   nothing is written and `EventStoreError::VersionConflict` is returned.
//! - Versions per aggregate form the gapless sequence `1..=N`.
//! - `get_events(id, Some(v))` returns only events with a version greater
//!   than `v`, in increasing version order.

use async_trait::async_trait;

use crate::errors::{EventStoreError, EventStoreResult};
use crate::message::{Event, Snapshot};
use crate::types::{AggregateId, EventType, EventVersion, Timestamp};

/// Append-only storage for aggregate event streams and their snapshots.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to the aggregate's stream.
    ///
    /// `expected_version` is the version the writer loaded (0 for a new
    /// aggregate). The events must be numbered `expected_version + 1` onwards
    /// and belong to `aggregate_id`.
    ///
    /// # Errors
    /// * `EventStoreError::VersionConflict` - the stream moved since it was read
    /// * `EventStoreError::InvalidEventSequence` - events are misnumbered
    /// * `EventStoreError::AggregateMismatch` - an event targets another stream
    async fn save_events(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<Event>,
        expected_version: EventVersion,
    ) -> EventStoreResult<()>;

    /// Reads an aggregate's events in version order, optionally only those
    /// after `after_version`.
    async fn get_events(
        &self,
        aggregate_id: &AggregateId,
        after_version: Option<EventVersion>,
    ) -> EventStoreResult<Vec<Event>>;

    /// Reads every event of one type, optionally from a point in time,
    /// ordered by timestamp.
    async fn get_events_by_type(
        &self,
        event_type: &EventType,
        from_timestamp: Option<Timestamp>,
    ) -> EventStoreResult<Vec<Event>>;

    /// Stores a snapshot, replacing any older one for the aggregate.
    async fn save_snapshot(&self, snapshot: Snapshot) -> EventStoreResult<()>;

    /// Returns the newest snapshot of the aggregate, if any.
    async fn get_snapshot(&self, aggregate_id: &AggregateId) -> EventStoreResult<Option<Snapshot>>;

    /// Reads every event across all aggregates, ordered by timestamp.
    ///
    /// Optional: backends that cannot scan the whole log keep the default,
    /// and unfiltered queries against them fail with `Unsupported`.
    async fn get_all_events(
        &self,
        _from_timestamp: Option<Timestamp>,
    ) -> EventStoreResult<Vec<Event>> {
        Err(EventStoreError::Unsupported(
            "scanning all events".to_string(),
        ))
    }
}

/// Checks that a batch may be appended at `expected_version`.
///
/// Backends call this inside their critical section, after the version
/// check, so that misnumbered batches are rejected without a partial write.
pub fn validate_batch(
    aggregate_id: &AggregateId,
    events: &[Event],
    expected_version: EventVersion,
) -> EventStoreResult<()> {
    let mut next = expected_version.next();
    for event in events {
        if event.aggregate_id != *aggregate_id {
            return Err(EventStoreError::AggregateMismatch {
                expected: aggregate_id.clone(),
                actual: event.aggregate_id.clone(),
            });
        }
        if event.version != next {
            return Err(EventStoreError::InvalidEventSequence {
                aggregate_id: aggregate_id.clone(),
                expected: next,
                actual: event.version,
            });
        }
        next = next.next();
    }
    Ok(())
}
