//! Read-only audit queries over the event history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::errors::EventStoreResult;
use crate::event_sourcing::EventSourcingEngine;
use crate::event_store::EventStore;
use crate::message::{Event, EventFilter, EventStream};
use crate::metadata::ActorId;
use crate::types::{AggregateId, Timestamp};

/// First and last timestamp covered by a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Earliest event
    pub start: Timestamp,
    /// Latest event
    pub end: Timestamp,
}

/// Event counts over a filtered slice of history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Number of matching events
    pub total_events: usize,
    /// Count per event type
    pub event_types: BTreeMap<String, usize>,
    /// Count per aggregate
    pub aggregates: BTreeMap<String, usize>,
    /// Covered range; `None` when nothing matched
    pub time_range: Option<TimeRange>,
}

impl AuditReport {
    fn from_events(events: &[Event]) -> Self {
        let mut event_types = BTreeMap::new();
        let mut aggregates = BTreeMap::new();
        for event in events {
            *event_types.entry(event.event_type.to_string()).or_insert(0) += 1;
            *aggregates.entry(event.aggregate_id.to_string()).or_insert(0) += 1;
        }
        let start = events.iter().map(|e| e.timestamp).min();
        let end = events.iter().map(|e| e.timestamp).max();
        Self {
            total_events: events.len(),
            event_types,
            aggregates,
            time_range: start.zip(end).map(|(start, end)| TimeRange { start, end }),
        }
    }
}

/// Audit trail queries. Performs no writes.
#[derive(Debug)]
pub struct AuditTrail<S: ?Sized> {
    engine: EventSourcingEngine<S>,
}

impl<S: EventStore + ?Sized> AuditTrail<S> {
    /// Creates an audit trail reading through `engine`.
    pub const fn new(engine: EventSourcingEngine<S>) -> Self {
        Self { engine }
    }

    /// Complete history of one aggregate.
    #[instrument(skip(self))]
    pub async fn get_audit_trail(&self, aggregate_id: &AggregateId) -> EventStoreResult<EventStream> {
        self.engine.metrics().audit_queries.increment();
        self.engine.get_event_stream(aggregate_id, None).await
    }

    /// Events attributed to `actor_id`, optionally from a point in time.
    #[instrument(skip(self))]
    pub async fn get_user_activity(
        &self,
        actor_id: &ActorId,
        from_timestamp: Option<Timestamp>,
    ) -> EventStoreResult<Vec<Event>> {
        self.engine.metrics().audit_queries.increment();
        let filter = EventFilter {
            from_timestamp,
            ..EventFilter::default()
        };
        let mut events = self.engine.query_events(&filter).await?;
        events.retain(|event| event.metadata.actor_id.as_ref() == Some(actor_id));
        Ok(events)
    }

    /// Events matching `filter`.
    #[instrument(skip(self))]
    pub async fn get_system_activity(&self, filter: &EventFilter) -> EventStoreResult<Vec<Event>> {
        self.engine.metrics().audit_queries.increment();
        self.engine.query_events(filter).await
    }

    /// Counts by type and aggregate, and the covered time range.
    #[instrument(skip(self))]
    pub async fn generate_audit_report(&self, filter: &EventFilter) -> EventStoreResult<AuditReport> {
        self.engine.metrics().audit_queries.increment();
        let events = self.engine.query_events(filter).await?;
        Ok(AuditReport::from_events(&events))
    }
}
