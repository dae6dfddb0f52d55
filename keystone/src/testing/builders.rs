//! Fluent builders for events and commands in tests.
//!
//! Identifiers are given as strings; a value that fails validation leaves
//! the builder's default in place.

use serde_json::Value;

use crate::message::{Command, Event};
use crate::metadata::{ActorId, CausationId, CorrelationId, EventMetadata};
use crate::types::{AggregateId, CommandType, EventId, EventType, EventVersion, Timestamp};

const DEFAULT_AGGREGATE: &str = "test-aggregate";

fn default_aggregate() -> AggregateId {
    AggregateId::try_new(DEFAULT_AGGREGATE).expect("default aggregate id is valid")
}

/// Builds [`Event`] values.
///
/// ```rust,ignore
/// let event = EventBuilder::new()
///     .aggregate_id("account-1")
///     .event_type("Deposited")
///     .payload(json!({"amount": 100}))
///     .version(3)
///     .with_actor("alice")
///     .build();
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct EventBuilder {
    aggregate_id: AggregateId,
    event_type: EventType,
    payload: Value,
    version: EventVersion,
    timestamp: Option<Timestamp>,
    event_id: Option<EventId>,
    metadata: EventMetadata,
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuilder {
    /// An event `TestEvent` at version 1 on `test-aggregate` with a null
    /// payload.
    pub fn new() -> Self {
        Self {
            aggregate_id: default_aggregate(),
            event_type: EventType::try_new("TestEvent").expect("default event type is valid"),
            payload: Value::Null,
            version: EventVersion::new(1),
            timestamp: None,
            event_id: None,
            metadata: EventMetadata::new(),
        }
    }

    /// Sets the aggregate id.
    pub fn aggregate_id(mut self, id: impl Into<String>) -> Self {
        if let Ok(id) = AggregateId::try_new(id.into()) {
            self.aggregate_id = id;
        }
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        if let Ok(event_type) = EventType::try_new(event_type.into()) {
            self.event_type = event_type;
        }
        self
    }

    /// Sets the payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the version.
    pub fn version(mut self, version: u64) -> Self {
        self.version = EventVersion::new(version);
        self
    }

    /// Fixes the timestamp instead of using the build time.
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Fixes the event id instead of generating one.
    pub const fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Records the acting user in the metadata.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        if let Ok(actor) = ActorId::try_new(actor.into()) {
            self.metadata = self.metadata.with_actor(actor);
        }
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.metadata = self.metadata.with_correlation_id(correlation_id);
        self
    }

    /// Marks the event as caused by another.
    pub fn caused_by(mut self, causation_id: impl Into<CausationId>) -> Self {
        self.metadata = self.metadata.caused_by(causation_id);
        self
    }

    /// Builds the event.
    pub fn build(self) -> Event {
        let mut event = Event::new(self.aggregate_id, self.event_type, self.payload, self.version)
            .with_metadata(self.metadata);
        if let Some(timestamp) = self.timestamp {
            event = event.with_timestamp(timestamp);
        }
        if let Some(id) = self.event_id {
            event.id = id;
        }
        event
    }

    /// Builds `count` consecutive events starting at the configured
    /// version, one millisecond apart when a timestamp is fixed.
    pub fn build_sequence(self, count: usize) -> Vec<Event> {
        let mut version = self.version;
        let mut events = Vec::with_capacity(count);
        for offset in 0..count {
            let mut event = self.clone().build();
            event.version = version;
            if let Some(timestamp) = self.timestamp {
                let step = chrono::Duration::milliseconds(i64::try_from(offset).unwrap_or(i64::MAX));
                event.timestamp = Timestamp::new(timestamp.into_datetime() + step);
            }
            events.push(event);
            version = version.next();
        }
        events
    }
}

/// Builds [`Command`] values.
#[derive(Debug, Clone)]
#[must_use]
pub struct CommandBuilder {
    command_type: CommandType,
    aggregate_id: AggregateId,
    payload: Value,
    actor: Option<ActorId>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuilder {
    /// A `TestCommand` on `test-aggregate` with a null payload.
    pub fn new() -> Self {
        Self {
            command_type: CommandType::try_new("TestCommand").expect("default command type is valid"),
            aggregate_id: default_aggregate(),
            payload: Value::Null,
            actor: None,
        }
    }

    /// Sets the command type.
    pub fn command_type(mut self, command_type: impl Into<String>) -> Self {
        if let Ok(command_type) = CommandType::try_new(command_type.into()) {
            self.command_type = command_type;
        }
        self
    }

    /// Sets the target aggregate.
    pub fn aggregate_id(mut self, id: impl Into<String>) -> Self {
        if let Ok(id) = AggregateId::try_new(id.into()) {
            self.aggregate_id = id;
        }
        self
    }

    /// Sets the payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the acting user.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = ActorId::try_new(actor.into()).ok();
        self
    }

    /// Builds the command.
    pub fn build(self) -> Command {
        let command = Command::new(self.command_type, self.aggregate_id, self.payload);
        match self.actor {
            Some(actor) => command.with_actor(actor),
            None => command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_builder_applies_fields() {
        let event = EventBuilder::new()
            .aggregate_id("account-1")
            .event_type("Deposited")
            .payload(json!({"amount": 100}))
            .version(4)
            .with_actor("alice")
            .build();

        assert_eq!(event.aggregate_id.as_ref(), "account-1");
        assert_eq!(event.event_type.as_ref(), "Deposited");
        assert_eq!(event.version, EventVersion::new(4));
        assert_eq!(event.metadata.actor_id.unwrap().as_ref(), "alice");
    }

    #[test]
    fn invalid_ids_keep_the_default() {
        let event = EventBuilder::new().aggregate_id("   ").build();
        assert_eq!(event.aggregate_id.as_ref(), DEFAULT_AGGREGATE);
    }

    #[test]
    fn sequences_are_consecutive_and_ordered() {
        let start = Timestamp::now();
        let events = EventBuilder::new()
            .version(3)
            .with_timestamp(start)
            .build_sequence(4);

        let versions: Vec<u64> = events.iter().map(|e| e.version.into_inner()).collect();
        assert_eq!(versions, [3, 4, 5, 6]);
        assert!(events.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
        assert!(events.windows(2).all(|pair| pair[0].id != pair[1].id));
    }

    #[test]
    fn command_builder_sets_actor() {
        let command = CommandBuilder::new()
            .command_type("Deposit")
            .aggregate_id("account-1")
            .with_actor("bob")
            .build();
        assert_eq!(command.command_type.as_ref(), "Deposit");
        assert_eq!(command.actor_id.unwrap().as_ref(), "bob");
    }
}
