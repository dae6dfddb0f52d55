//! Event-sourcing engine: hydration, commits, snapshots and temporal queries.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::config::SnapshotFrequency;
use crate::errors::{EventStoreError, EventStoreResult};
use crate::event_store::EventStore;
use crate::message::{Event, EventFilter, EventStream, Snapshot};
use crate::metrics::EventSourcingMetrics;
use crate::types::{AggregateId, EventVersion, Timestamp};

/// Loads and commits aggregates on top of an [`EventStore`].
pub struct EventSourcingEngine<S: ?Sized> {
    store: Arc<S>,
    snapshot_frequency: SnapshotFrequency,
    metrics: Arc<EventSourcingMetrics>,
}

impl<S: ?Sized> Clone for EventSourcingEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            snapshot_frequency: self.snapshot_frequency,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for EventSourcingEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourcingEngine")
            .field("snapshot_frequency", &self.snapshot_frequency)
            .finish_non_exhaustive()
    }
}

/// Whether moving from `before` to `after` passes a multiple of `frequency`.
fn crosses_snapshot_boundary(before: EventVersion, after: EventVersion, frequency: u64) -> bool {
    let before: u64 = before.into();
    let after: u64 = after.into();
    after / frequency > before / frequency
}

impl<S: EventStore + ?Sized> EventSourcingEngine<S> {
    /// Creates an engine over `store`.
    pub fn new(store: Arc<S>, snapshot_frequency: SnapshotFrequency) -> Self {
        Self {
            store,
            snapshot_frequency,
            metrics: Arc::new(EventSourcingMetrics::default()),
        }
    }

    /// Reports into shared metrics instead of private ones.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<EventSourcingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The underlying store.
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persistence counters.
    pub const fn metrics(&self) -> &Arc<EventSourcingMetrics> {
        &self.metrics
    }

    /// Snapshot cadence.
    pub const fn snapshot_frequency(&self) -> SnapshotFrequency {
        self.snapshot_frequency
    }

    /// Appends events with an optimistic concurrency check.
    ///
    /// This raw path takes no snapshots, since it has no aggregate state to
    /// capture; [`commit`](Self::commit) does.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn save_events(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<Event>,
        expected_version: EventVersion,
    ) -> EventStoreResult<()> {
        let count = u64::try_from(events.len()).unwrap_or(u64::MAX);
        self.store
            .save_events(aggregate_id, events, expected_version)
            .await?;
        self.metrics.events_stored.increment_by(count);
        Ok(())
    }

    /// Hydrates an aggregate from its newest snapshot plus the events after it.
    ///
    /// A snapshot that cannot be decoded is ignored and the aggregate is
    /// replayed from its first event.
    #[instrument(skip(self))]
    pub async fn load_aggregate<A: Aggregate>(
        &self,
        aggregate_id: &AggregateId,
    ) -> EventStoreResult<AggregateRoot<A>> {
        let restored = match self.store.get_snapshot(aggregate_id).await? {
            Some(snapshot) => match serde_json::from_value::<A>(snapshot.state) {
                Ok(state) => Some(AggregateRoot::from_state(
                    aggregate_id.clone(),
                    state,
                    snapshot.version,
                )),
                Err(error) => {
                    warn!(%aggregate_id, %error, "ignoring undecodable snapshot");
                    None
                }
            },
            None => None,
        };

        let mut root = restored.unwrap_or_else(|| AggregateRoot::new(aggregate_id.clone()));
        let after = Some(root.committed_version()).filter(|v| !v.is_initial());
        let events = self.store.get_events(aggregate_id, after).await?;
        for event in &events {
            root.replay(event);
        }

        self.metrics.aggregates_loaded.increment();
        debug!(
            %aggregate_id,
            version = %root.committed_version(),
            replayed = events.len(),
            "aggregate loaded"
        );
        Ok(root)
    }

    /// Rebuilds an aggregate from its full history, ignoring snapshots.
    pub async fn rebuild_aggregate<A: Aggregate>(
        &self,
        aggregate_id: &AggregateId,
    ) -> EventStoreResult<AggregateRoot<A>> {
        let mut root = AggregateRoot::new(aggregate_id.clone());
        for event in self.store.get_events(aggregate_id, None).await? {
            root.replay(&event);
        }
        Ok(root)
    }

    /// Persists the aggregate's uncommitted events and returns them.
    ///
    /// The aggregate's committed version is the expected version. When the
    /// new version passes a multiple of the snapshot frequency a snapshot is
    /// taken; a failed snapshot is logged and counted but never fails the
    /// commit.
    #[instrument(skip(self, root), fields(aggregate_id = %root.id()))]
    pub async fn commit<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
    ) -> EventStoreResult<Vec<Event>> {
        if !root.has_uncommitted() {
            return Ok(Vec::new());
        }

        let before = root.committed_version();
        let events = root.uncommitted_events().to_vec();
        self.save_events(root.id(), events, before).await?;
        let committed = root.mark_committed();

        if crosses_snapshot_boundary(
            before,
            root.committed_version(),
            self.snapshot_frequency.into_inner(),
        ) {
            if let Err(error) = self.create_snapshot(root).await {
                self.metrics.snapshot_failures.increment();
                warn!(aggregate_id = %root.id(), %error, "snapshot failed");
            }
        }

        Ok(committed)
    }

    /// Snapshots the committed state of a loaded aggregate.
    pub async fn create_snapshot<A: Aggregate>(
        &self,
        root: &AggregateRoot<A>,
    ) -> EventStoreResult<Snapshot> {
        if root.has_uncommitted() {
            return Err(EventStoreError::Internal(format!(
                "aggregate '{}' has uncommitted events",
                root.id()
            )));
        }
        let snapshot = Snapshot {
            aggregate_id: root.id().clone(),
            state: serde_json::to_value(root.state())?,
            version: root.committed_version(),
            timestamp: Timestamp::now(),
        };
        self.store.save_snapshot(snapshot.clone()).await?;
        self.metrics.snapshots_created.increment();
        debug!(aggregate_id = %root.id(), version = %snapshot.version, "snapshot created");
        Ok(snapshot)
    }

    /// The aggregate's events with their version and last timestamp.
    pub async fn get_event_stream(
        &self,
        aggregate_id: &AggregateId,
        after_version: Option<EventVersion>,
    ) -> EventStoreResult<EventStream> {
        let events = self.store.get_events(aggregate_id, after_version).await?;
        Ok(EventStream::from_events(aggregate_id.clone(), events))
    }

    /// Raw events of one aggregate, optionally after a version.
    pub async fn replay_events(
        &self,
        aggregate_id: &AggregateId,
        after_version: Option<EventVersion>,
    ) -> EventStoreResult<Vec<Event>> {
        self.store.get_events(aggregate_id, after_version).await
    }

    /// Version of the aggregate's last event, or 0.
    pub async fn get_aggregate_version(
        &self,
        aggregate_id: &AggregateId,
    ) -> EventStoreResult<EventVersion> {
        let events = self.store.get_events(aggregate_id, None).await?;
        Ok(events
            .last()
            .map_or_else(EventVersion::initial, |event| event.version))
    }

    /// Whether the aggregate has any events.
    pub async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> EventStoreResult<bool> {
        Ok(!self.get_aggregate_version(aggregate_id).await?.is_initial())
    }

    /// Selects events across aggregates.
    ///
    /// Reads by aggregate when the filter names aggregates, by type when it
    /// names types, and scans the whole log otherwise. Results are ordered by
    /// timestamp, then aggregate and version, so the order is deterministic.
    #[instrument(skip(self))]
    pub async fn query_events(&self, filter: &EventFilter) -> EventStoreResult<Vec<Event>> {
        let mut events = if let Some(ids) = &filter.aggregate_ids {
            let unique: BTreeSet<&AggregateId> = ids.iter().collect();
            let mut collected = Vec::new();
            for id in unique {
                collected.extend(self.store.get_events(id, None).await?);
            }
            collected
        } else if let Some(types) = &filter.event_types {
            let unique: BTreeSet<_> = types.iter().collect();
            let mut collected = Vec::new();
            for event_type in unique {
                collected.extend(
                    self.store
                        .get_events_by_type(event_type, filter.from_timestamp)
                        .await?,
                );
            }
            collected
        } else {
            self.store.get_all_events(filter.from_timestamp).await?
        };

        events.retain(|event| filter.matches(event));
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(events)
    }
}
