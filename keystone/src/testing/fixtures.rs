//! A counter aggregate with command, query and projection handlers.
//!
//! `Increment` and `Decrement` commands carry `{"amount": n}` with a
//! positive `n`; a decrement below zero is rejected. The `CounterValue`
//! query takes `{"id": "<aggregate>"}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::aggregate::{Aggregate, AggregateCommandHandler, AggregateRoot};
use crate::cqrs::{CqrsEngine, QueryHandler};
use crate::errors::{
    CommandError, CommandResult, CoordinationResult, ProjectionError, ProjectionResult,
    QueryError, QueryResult,
};
use crate::event_sourcing::EventSourcingEngine;
use crate::event_store::EventStore;
use crate::message::{Command, Event, Query};
use crate::projection::ProjectionHandler;
use crate::types::{AggregateId, CommandType, EventType, ProjectionName, QueryType};

/// Event raised by `Increment`.
pub const INCREMENTED: &str = "Incremented";
/// Event raised by `Decrement`.
pub const DECREMENTED: &str = "Decremented";
/// Command adding to a counter.
pub const INCREMENT: &str = "Increment";
/// Command subtracting from a counter.
pub const DECREMENT: &str = "Decrement";
/// Query reading one counter.
pub const COUNTER_VALUE: &str = "CounterValue";
/// Name of [`CounterTotals`].
pub const COUNTER_TOTALS: &str = "counter-totals";

fn event_type(name: &str) -> EventType {
    EventType::try_new(name).expect("fixture event type is valid")
}

fn command_type(name: &str) -> CommandType {
    CommandType::try_new(name).expect("fixture command type is valid")
}

/// Counter state.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Current value
    pub value: i64,
    /// Number of changes folded in
    pub changes: u64,
}

fn amount(payload: &Value) -> Option<i64> {
    payload.get("amount").and_then(Value::as_i64)
}

impl Aggregate for Counter {
    fn apply(&mut self, event: &Event) {
        let delta = amount(&event.payload).unwrap_or(0);
        match event.event_type.as_ref() {
            INCREMENTED => self.value += delta,
            DECREMENTED => self.value -= delta,
            _ => return,
        }
        self.changes += 1;
    }
}

/// An `Increment` command.
pub fn increment(aggregate_id: &AggregateId, amount: i64) -> Command {
    Command::new(command_type(INCREMENT), aggregate_id.clone(), json!({ "amount": amount }))
}

/// A `Decrement` command.
pub fn decrement(aggregate_id: &AggregateId, amount: i64) -> Command {
    Command::new(command_type(DECREMENT), aggregate_id.clone(), json!({ "amount": amount }))
}

/// A `CounterValue` query.
pub fn counter_value(aggregate_id: &AggregateId) -> Query {
    Query::new(
        QueryType::try_new(COUNTER_VALUE).expect("fixture query type is valid"),
        json!({ "id": aggregate_id.as_ref() }),
    )
}

fn positive_amount(command: &Command) -> CommandResult<i64> {
    match amount(&command.payload) {
        Some(amount) if amount > 0 => Ok(amount),
        _ => Err(CommandError::ValidationFailed(format!(
            "'{}' needs a positive integer amount",
            command.command_type
        ))),
    }
}

fn apply_increment(command: &Command, root: &mut AggregateRoot<Counter>) -> CommandResult<()> {
    let amount = positive_amount(command)?;
    root.raise(event_type(INCREMENTED), json!({ "amount": amount }));
    Ok(())
}

fn apply_decrement(command: &Command, root: &mut AggregateRoot<Counter>) -> CommandResult<()> {
    let amount = positive_amount(command)?;
    if root.state().value < amount {
        return Err(CommandError::BusinessRuleViolation(format!(
            "counter {} cannot go below zero",
            root.id()
        )));
    }
    root.raise(event_type(DECREMENTED), json!({ "amount": amount }));
    Ok(())
}

/// Answers `CounterValue` with `{"value", "version"}`.
pub struct CounterValueHandler<S: ?Sized> {
    engine: EventSourcingEngine<S>,
}

impl<S: ?Sized> CounterValueHandler<S> {
    /// A handler reading through `engine`.
    pub const fn new(engine: EventSourcingEngine<S>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: EventStore + ?Sized + 'static> QueryHandler for CounterValueHandler<S> {
    fn name(&self) -> &str {
        "counter-value"
    }

    async fn handle(&self, query: &Query) -> QueryResult<Value> {
        let id = query
            .parameters
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| AggregateId::try_new(id).ok())
            .ok_or_else(|| QueryError::InvalidParameters("expected a counter id".into()))?;
        let root = self.engine.load_aggregate::<Counter>(&id).await?;
        Ok(json!({
            "value": root.state().value,
            "version": root.version(),
        }))
    }
}

/// Registers the counter command and query handlers on `cqrs`.
pub fn register_counter<S: EventStore + ?Sized + 'static>(
    cqrs: &CqrsEngine,
    engine: &EventSourcingEngine<S>,
) -> CoordinationResult<()> {
    cqrs.register_command_handler(
        command_type(INCREMENT),
        Arc::new(AggregateCommandHandler::new(
            "counter-increment",
            command_type(INCREMENT),
            engine.clone(),
            apply_increment,
        )),
    )?;
    cqrs.register_command_handler(
        command_type(DECREMENT),
        Arc::new(AggregateCommandHandler::new(
            "counter-decrement",
            command_type(DECREMENT),
            engine.clone(),
            apply_decrement,
        )),
    )?;
    cqrs.register_query_handler(
        QueryType::try_new(COUNTER_VALUE).expect("fixture query type is valid"),
        Arc::new(CounterValueHandler::new(engine.clone())),
    )?;
    Ok(())
}

/// Read model `{"<aggregate>": value}` over every counter.
#[derive(Debug)]
pub struct CounterTotals {
    name: ProjectionName,
}

impl Default for CounterTotals {
    fn default() -> Self {
        Self {
            name: ProjectionName::try_new(COUNTER_TOTALS).expect("fixture projection name is valid"),
        }
    }
}

#[async_trait]
impl ProjectionHandler for CounterTotals {
    fn name(&self) -> &ProjectionName {
        &self.name
    }

    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.event_type.as_ref(), INCREMENTED | DECREMENTED)
    }

    async fn handle(&self, current: &Value, event: &Event) -> ProjectionResult<Value> {
        let delta = amount(&event.payload)
            .ok_or_else(|| ProjectionError::Handler(format!("event {} has no amount", event.id)))?;
        let mut totals = current.as_object().cloned().unwrap_or_else(Map::new);
        let key = event.aggregate_id.to_string();
        let previous = totals.get(&key).and_then(Value::as_i64).unwrap_or(0);
        let next = if event.event_type.as_ref() == DECREMENTED {
            previous - delta
        } else {
            previous + delta
        };
        totals.insert(key, Value::from(next));
        Ok(Value::Object(totals))
    }
}
