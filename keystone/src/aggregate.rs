//! Aggregates: in-memory state folded from one event stream.
//!
//! An [`AggregateRoot`] is owned by the command currently executing against
//! it. It tracks the version it was loaded at and the events raised since,
//! which are flushed with that version as `expected_version`.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cqrs::CommandHandler;
use crate::errors::CommandResult;
use crate::event_sourcing::EventSourcingEngine;
use crate::event_store::EventStore;
use crate::message::{Command, Event};
use crate::metadata::EventMetadata;
use crate::types::{AggregateId, CommandType, EventType, EventVersion};

/// State that can be rebuilt by folding events.
///
/// The state is serialized as-is into snapshots, so it must round-trip
/// through serde.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Folds one event into the state. Unknown event types are ignored.
    fn apply(&mut self, event: &Event);
}

/// An aggregate together with its identity, version and pending events.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRoot<A> {
    id: AggregateId,
    committed_version: EventVersion,
    state: A,
    uncommitted: Vec<Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// An aggregate with no history.
    pub fn new(id: AggregateId) -> Self {
        Self::from_state(id, A::default(), EventVersion::initial())
    }

    /// An aggregate restored from a snapshot taken at `version`.
    pub const fn from_state(id: AggregateId, state: A, version: EventVersion) -> Self {
        Self {
            id,
            committed_version: version,
            state,
            uncommitted: Vec::new(),
        }
    }

    /// The aggregate id.
    pub const fn id(&self) -> &AggregateId {
        &self.id
    }

    /// Version including raised but uncommitted events.
    pub fn version(&self) -> EventVersion {
        let pending = u64::try_from(self.uncommitted.len()).unwrap_or(u64::MAX);
        self.committed_version.advance(pending)
    }

    /// Version of the last persisted event that has been applied.
    pub const fn committed_version(&self) -> EventVersion {
        self.committed_version
    }

    /// Current state.
    pub const fn state(&self) -> &A {
        &self.state
    }

    /// Applies an already persisted event while hydrating.
    pub fn replay(&mut self, event: &Event) {
        self.state.apply(event);
        self.committed_version = event.version;
    }

    /// Records a new event: applies it and queues it for commit.
    ///
    /// Returns the version assigned to the event.
    pub fn raise(&mut self, event_type: EventType, payload: Value) -> EventVersion {
        self.raise_with_metadata(event_type, payload, EventMetadata::default())
    }

    /// Like [`raise`](Self::raise), attaching metadata.
    pub fn raise_with_metadata(
        &mut self,
        event_type: EventType,
        payload: Value,
        metadata: EventMetadata,
    ) -> EventVersion {
        let version = self.version().next();
        let event =
            Event::new(self.id.clone(), event_type, payload, version).with_metadata(metadata);
        self.state.apply(&event);
        self.uncommitted.push(event);
        version
    }

    /// Events raised since the last commit.
    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Whether any events wait to be committed.
    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Fills causation and actor on uncommitted events that lack them.
    pub fn attribute_uncommitted(&mut self, command: &Command) {
        for event in &mut self.uncommitted {
            if event.metadata.causation_id.is_none() {
                event.metadata.causation_id = Some(command.id.into());
            }
            if event.metadata.actor_id.is_none() {
                event.metadata.actor_id.clone_from(&command.actor_id);
            }
        }
    }

    pub(crate) fn mark_committed(&mut self) -> Vec<Event> {
        self.committed_version = self.version();
        std::mem::take(&mut self.uncommitted)
    }
}

/// Command handler that loads an aggregate, lets a decision function raise
/// events on it, and commits them.
///
/// The decision function returns an error to reject the command; nothing is
/// persisted in that case.
pub struct AggregateCommandHandler<A, S: ?Sized, F> {
    name: String,
    command_type: CommandType,
    engine: EventSourcingEngine<S>,
    decide: F,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, S, F> AggregateCommandHandler<A, S, F>
where
    A: Aggregate,
    S: EventStore + ?Sized,
    F: Fn(&Command, &mut AggregateRoot<A>) -> CommandResult<()> + Send + Sync,
{
    /// Creates a handler claiming commands of `command_type`.
    pub fn new(
        name: impl Into<String>,
        command_type: CommandType,
        engine: EventSourcingEngine<S>,
        decide: F,
    ) -> Self {
        Self {
            name: name.into(),
            command_type,
            engine,
            decide,
            _aggregate: PhantomData,
        }
    }
}

#[async_trait]
impl<A, S, F> CommandHandler for AggregateCommandHandler<A, S, F>
where
    A: Aggregate,
    S: EventStore + ?Sized + 'static,
    F: Fn(&Command, &mut AggregateRoot<A>) -> CommandResult<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, command: &Command) -> bool {
        command.command_type == self.command_type
    }

    async fn handle(&self, command: &Command) -> CommandResult<Vec<Event>> {
        let mut root = self
            .engine
            .load_aggregate::<A>(&command.aggregate_id)
            .await?;
        (self.decide)(command, &mut root)?;
        root.attribute_uncommitted(command);
        Ok(self.engine.commit(&mut root).await?)
    }
}
