use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keystone::errors::{EventStoreError, EventStoreResult};
use keystone::event_store::{validate_batch, EventStore};
use keystone::message::{Event, Snapshot};
use keystone::types::{AggregateId, EventId, EventType, EventVersion, Timestamp};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Default)]
struct Log {
    streams: HashMap<AggregateId, Vec<Event>>,
    snapshots: HashMap<AggregateId, Snapshot>,
    event_ids: HashSet<EventId>,
}

/// Thread-safe in-memory event store.
///
/// The version check and the append happen under one write lock, so
/// concurrent writers to the same aggregate see exactly one winner.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
    fail_snapshots: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.read();
        f.debug_struct("InMemoryEventStore")
            .field("aggregates", &log.streams.len())
            .field("events", &log.event_ids.len())
            .field("snapshots", &log.snapshots.len())
            .finish()
    }
}

impl InMemoryEventStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `save_snapshot` fail, or succeed again.
    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// Events stored across all aggregates.
    pub fn event_count(&self) -> usize {
        self.log.read().event_ids.len()
    }

    /// Aggregates with at least one event.
    pub fn aggregate_count(&self) -> usize {
        self.log.read().streams.len()
    }

    /// Snapshots currently held.
    pub fn snapshot_count(&self) -> usize {
        self.log.read().snapshots.len()
    }
}

fn by_time(a: &Event, b: &Event) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
        .then_with(|| a.version.cmp(&b.version))
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_events(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<Event>,
        expected_version: EventVersion,
    ) -> EventStoreResult<()> {
        let mut log = self.log.write();

        let current = log
            .streams
            .get(aggregate_id)
            .and_then(|stream| stream.last())
            .map_or_else(EventVersion::initial, |event| event.version);
        if current != expected_version {
            return Err(EventStoreError::VersionConflict {
                aggregate_id: aggregate_id.clone(),
                expected: expected_version,
                current,
            });
        }
        validate_batch(aggregate_id, &events, expected_version)?;

        let mut batch_ids = HashSet::with_capacity(events.len());
        for event in &events {
            if log.event_ids.contains(&event.id) || !batch_ids.insert(event.id) {
                return Err(EventStoreError::DuplicateEventId(event.id));
            }
        }
        if events.is_empty() {
            return Ok(());
        }

        log.event_ids.extend(batch_ids);
        let count = events.len();
        log.streams
            .entry(aggregate_id.clone())
            .or_default()
            .extend(events);
        debug!(%aggregate_id, count, "events appended");
        Ok(())
    }

    async fn get_events(
        &self,
        aggregate_id: &AggregateId,
        after_version: Option<EventVersion>,
    ) -> EventStoreResult<Vec<Event>> {
        let log = self.log.read();
        let Some(stream) = log.streams.get(aggregate_id) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .iter()
            .filter(|event| after_version.map_or(true, |after| event.version > after))
            .cloned()
            .collect())
    }

    async fn get_events_by_type(
        &self,
        event_type: &EventType,
        from_timestamp: Option<Timestamp>,
    ) -> EventStoreResult<Vec<Event>> {
        let mut events: Vec<Event> = self
            .log
            .read()
            .streams
            .values()
            .flatten()
            .filter(|event| &event.event_type == event_type)
            .filter(|event| from_timestamp.map_or(true, |from| event.timestamp >= from))
            .cloned()
            .collect();
        events.sort_by(by_time);
        Ok(events)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> EventStoreResult<()> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(EventStoreError::ConnectionFailed(
                "snapshot storage unavailable".to_string(),
            ));
        }
        let mut log = self.log.write();
        let newer = log
            .snapshots
            .get(&snapshot.aggregate_id)
            .map_or(true, |existing| snapshot.version >= existing.version);
        if newer {
            log.snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
        }
        Ok(())
    }

    async fn get_snapshot(&self, aggregate_id: &AggregateId) -> EventStoreResult<Option<Snapshot>> {
        Ok(self.log.read().snapshots.get(aggregate_id).cloned())
    }

    async fn get_all_events(
        &self,
        from_timestamp: Option<Timestamp>,
    ) -> EventStoreResult<Vec<Event>> {
        let mut events: Vec<Event> = self
            .log
            .read()
            .streams
            .values()
            .flatten()
            .filter(|event| from_timestamp.map_or(true, |from| event.timestamp >= from))
            .cloned()
            .collect();
        events.sort_by(by_time);
        Ok(events)
    }
}
