//! Commands, queries, events and the read-side shapes built from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::{ActorId, EventMetadata};
use crate::types::{
    AggregateId, CommandId, CommandType, EventId, EventType, EventVersion, QueryId, QueryType,
    Timestamp,
};

/// A request to change the state of one aggregate.
///
/// Commands are immutable once created and are consumed by exactly one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique command id
    pub id: CommandId,
    /// Routing key
    pub command_type: CommandType,
    /// The aggregate the command targets
    pub aggregate_id: AggregateId,
    /// Command-specific data
    pub payload: Value,
    /// When the command was created
    pub timestamp: Timestamp,
    /// Who issued the command
    pub actor_id: Option<ActorId>,
}

impl Command {
    /// Creates a command stamped with a fresh id and the current time.
    pub fn new(command_type: CommandType, aggregate_id: AggregateId, payload: Value) -> Self {
        Self {
            id: CommandId::generate(),
            command_type,
            aggregate_id,
            payload,
            timestamp: Timestamp::now(),
            actor_id: None,
        }
    }

    /// Attributes the command to an actor.
    #[must_use]
    pub fn with_actor(mut self, actor_id: ActorId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}

/// A side-effect free read request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Unique query id
    pub id: QueryId,
    /// Routing key
    pub query_type: QueryType,
    /// Query parameters
    pub parameters: Value,
    /// When the query was created
    pub timestamp: Timestamp,
}

impl Query {
    /// Creates a query stamped with a fresh id and the current time.
    pub fn new(query_type: QueryType, parameters: Value) -> Self {
        Self {
            id: QueryId::generate(),
            query_type,
            parameters,
            timestamp: Timestamp::now(),
        }
    }
}

/// An immutable fact recorded against an aggregate.
///
/// For one aggregate, versions form the gapless sequence `1..=N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event id
    pub id: EventId,
    /// The aggregate this event belongs to
    pub aggregate_id: AggregateId,
    /// The event type
    pub event_type: EventType,
    /// Event-specific data
    pub payload: Value,
    /// Position within the aggregate stream
    pub version: EventVersion,
    /// When the event happened
    pub timestamp: Timestamp,
    /// Causation, correlation and actor
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    /// Creates an event with a fresh id and the current time.
    pub fn new(
        aggregate_id: AggregateId,
        event_type: EventType,
        payload: Value,
        version: EventVersion,
    ) -> Self {
        Self {
            id: EventId::generate(),
            aggregate_id,
            event_type,
            payload,
            version,
            timestamp: Timestamp::now(),
            metadata: EventMetadata::default(),
        }
    }

    /// Replaces the event metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Overrides the timestamp, e.g. when importing history.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A compaction checkpoint of an aggregate's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The aggregate
    pub aggregate_id: AggregateId,
    /// Opaque serialized aggregate state
    pub state: Value,
    /// The version the state reflects
    pub version: EventVersion,
    /// When the snapshot was taken
    pub timestamp: Timestamp,
}

/// The full event history of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStream {
    /// The aggregate
    pub aggregate_id: AggregateId,
    /// Events in version order
    pub events: Vec<Event>,
    /// Version of the last event, or 0
    pub version: EventVersion,
    /// Timestamp of the last event, or now for an empty stream
    pub timestamp: Timestamp,
}

impl EventStream {
    /// Builds a stream record from events already in version order.
    pub fn from_events(aggregate_id: AggregateId, events: Vec<Event>) -> Self {
        let (version, timestamp) = events.last().map_or_else(
            || (EventVersion::initial(), Timestamp::now()),
            |last| (last.version, last.timestamp),
        );
        Self {
            aggregate_id,
            events,
            version,
            timestamp,
        }
    }
}

/// Criteria for selecting events across aggregates.
///
/// Every populated field must match; an empty filter selects everything.
/// Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events of these aggregates
    pub aggregate_ids: Option<Vec<AggregateId>>,
    /// Only events of these types
    pub event_types: Option<Vec<EventType>>,
    /// Only events at or after this time
    pub from_timestamp: Option<Timestamp>,
    /// Only events at or before this time
    pub to_timestamp: Option<Timestamp>,
    /// Only events at or above this version
    pub from_version: Option<EventVersion>,
    /// Only events at or below this version
    pub to_version: Option<EventVersion>,
}

impl EventFilter {
    /// A filter that selects every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to the given event types.
    #[must_use]
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    /// Restricts to the given aggregates.
    #[must_use]
    pub fn with_aggregate_ids(mut self, ids: impl IntoIterator<Item = AggregateId>) -> Self {
        self.aggregate_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restricts to events at or after `from`.
    #[must_use]
    pub const fn since(mut self, from: Timestamp) -> Self {
        self.from_timestamp = Some(from);
        self
    }

    /// Restricts to events at or before `to`.
    #[must_use]
    pub const fn until(mut self, to: Timestamp) -> Self {
        self.to_timestamp = Some(to);
        self
    }

    /// Restricts to versions within `from..=to`.
    #[must_use]
    pub const fn with_versions(mut self, from: Option<EventVersion>, to: Option<EventVersion>) -> Self {
        self.from_version = from;
        self.to_version = to;
        self
    }

    /// Whether the event satisfies every populated criterion.
    pub fn matches(&self, event: &Event) -> bool {
        self.aggregate_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&event.aggregate_id))
            && self
                .event_types
                .as_ref()
                .map_or(true, |types| types.contains(&event.event_type))
            && self.from_timestamp.map_or(true, |from| event.timestamp >= from)
            && self.to_timestamp.map_or(true, |to| event.timestamp <= to)
            && self.from_version.map_or(true, |from| event.version >= from)
            && self.to_version.map_or(true, |to| event.version <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event(aggregate: &str, event_type: &str, version: u64) -> Event {
        Event::new(
            AggregateId::try_new(aggregate).unwrap(),
            EventType::try_new(event_type).unwrap(),
            json!({}),
            EventVersion::new(version),
        )
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(EventFilter::all().matches(&event("a", "Opened", 1)));
    }

    #[test]
    fn filter_combines_criteria() {
        let filter = EventFilter::all()
            .with_event_types([EventType::try_new("Deposited").unwrap()])
            .with_versions(Some(EventVersion::new(2)), None);

        assert!(filter.matches(&event("a", "Deposited", 2)));
        assert!(!filter.matches(&event("a", "Deposited", 1)));
        assert!(!filter.matches(&event("a", "Opened", 3)));
    }

    #[test]
    fn timestamp_bounds_are_inclusive() {
        let base = Timestamp::now();
        let stamped = event("a", "Opened", 1).with_timestamp(base);
        assert!(EventFilter::all().since(base).until(base).matches(&stamped));

        let later = Timestamp::new(base.into_datetime() + Duration::seconds(1));
        assert!(!EventFilter::all().since(later).matches(&stamped));
    }

    #[test]
    fn stream_reports_last_version() {
        let events = vec![event("a", "Opened", 1), event("a", "Deposited", 2)];
        let stream = EventStream::from_events(AggregateId::try_new("a").unwrap(), events);
        assert_eq!(stream.version, EventVersion::new(2));
    }

    #[test]
    fn empty_stream_is_at_initial_version() {
        let stream = EventStream::from_events(AggregateId::try_new("a").unwrap(), Vec::new());
        assert!(stream.version.is_initial());
    }
}
