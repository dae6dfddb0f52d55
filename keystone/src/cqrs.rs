//! Command, query and event dispatch.
//!
//! Handlers are registered under a stable type key. Several handlers may be
//! registered for one command or query type; at dispatch time exactly one of
//! them must claim the message through [`CommandHandler::can_handle`], or the
//! call fails with a routing error before any handler runs.
//!
//! Events returned by a command handler are delivered to every subscriber of
//! the [`EventBus`] that claims them. A failing subscriber is logged and
//! reported in the [`CommandOutcome`]; it never rolls the command back and is
//! not retried here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::errors::{CommandError, CommandResult, CoordinationError, QueryError, QueryResult};
use crate::message::{Command, Event, Query};
use crate::metrics::CqrsMetrics;
use crate::types::{CommandType, EventId, EventType, QueryType};

/// Executes commands of one type.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Unique name of the handler within its command type.
    fn name(&self) -> &str;

    /// Whether this handler claims the command. Defaults to claiming all.
    fn can_handle(&self, _command: &Command) -> bool {
        true
    }

    /// Executes the command and returns the events it produced.
    ///
    /// Handlers persist their own events (see `AggregateCommandHandler`);
    /// the engine only publishes what is returned.
    async fn handle(&self, command: &Command) -> CommandResult<Vec<Event>>;
}

/// Answers queries of one type.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Unique name of the handler within its query type.
    fn name(&self) -> &str;

    /// Whether this handler claims the query. Defaults to claiming all.
    fn can_handle(&self, _query: &Query) -> bool {
        true
    }

    /// Runs the query. Must not have side effects.
    async fn handle(&self, query: &Query) -> QueryResult<Value>;
}

/// Reacts to published events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used when reporting delivery failures.
    fn name(&self) -> &str;

    /// Whether this handler wants the event. Defaults to all.
    fn can_handle(&self, _event: &Event) -> bool {
        true
    }

    /// Processes one event.
    async fn handle(&self, event: &Event) -> Result<(), CoordinationError>;
}

/// One event that a subscriber failed to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    /// The failing subscriber
    pub handler: String,
    /// The event it failed on
    pub event_id: EventId,
    /// The event's type
    pub event_type: EventType,
    /// The subscriber's error
    pub error: String,
}

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Events produced by the handler, in order
    pub events: Vec<Event>,
    /// Subscriber failures during publication
    pub failed_deliveries: Vec<DeliveryFailure>,
}

/// Typed publish/subscribe channel for events.
///
/// Subscribers register either for one event type or for every event.
/// Delivery is sequential and in order; each subscriber's failure is
/// isolated from the others.
#[derive(Default)]
pub struct EventBus {
    by_type: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    wildcard: RwLock<Vec<Arc<dyn EventHandler>>>,
    metrics: Arc<CqrsMetrics>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.by_type.read().len())
            .field("wildcard_subscribers", &self.wildcard.read().len())
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty bus reporting into shared metrics.
    pub fn with_metrics(metrics: Arc<CqrsMetrics>) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }

    /// Subscribes `handler` to events of `event_type`.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        debug!(%event_type, handler = handler.name(), "event handler registered");
        self.by_type.write().entry(event_type).or_default().push(handler);
    }

    /// Subscribes `handler` to every event.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "wildcard event handler registered");
        self.wildcard.write().push(handler);
    }

    fn subscribers_for(&self, event: &Event) -> Vec<Arc<dyn EventHandler>> {
        let mut subscribers: Vec<Arc<dyn EventHandler>> = self
            .by_type
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        subscribers.extend(self.wildcard.read().iter().cloned());
        subscribers
    }

    /// Delivers one event to every claiming subscriber.
    pub async fn publish(&self, event: &Event) -> Vec<DeliveryFailure> {
        let mut failures = Vec::new();
        for handler in self.subscribers_for(event) {
            if !handler.can_handle(event) {
                continue;
            }
            self.metrics.events_published.increment();
            if let Err(error) = handler.handle(event).await {
                self.metrics.publish_failures.increment();
                warn!(
                    handler = handler.name(),
                    event_id = %event.id,
                    event_type = %event.event_type,
                    %error,
                    "event handler failed"
                );
                failures.push(DeliveryFailure {
                    handler: handler.name().to_string(),
                    event_id: event.id,
                    event_type: event.event_type.clone(),
                    error: error.to_string(),
                });
            }
        }
        failures
    }

    /// Delivers events in order.
    pub async fn publish_all(&self, events: &[Event]) -> Vec<DeliveryFailure> {
        let mut failures = Vec::new();
        for event in events {
            failures.extend(self.publish(event).await);
        }
        failures
    }
}

type CommandRegistry = HashMap<CommandType, Vec<Arc<dyn CommandHandler>>>;
type QueryRegistry = HashMap<QueryType, Vec<Arc<dyn QueryHandler>>>;

/// Routes commands and queries to their handlers and publishes events.
pub struct CqrsEngine {
    commands: RwLock<CommandRegistry>,
    queries: RwLock<QueryRegistry>,
    bus: Arc<EventBus>,
    metrics: Arc<CqrsMetrics>,
}

impl std::fmt::Debug for CqrsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqrsEngine")
            .field("command_types", &self.commands.read().len())
            .field("query_types", &self.queries.read().len())
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Default for CqrsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CqrsEngine {
    /// Creates an engine with its own event bus.
    pub fn new() -> Self {
        let metrics = Arc::new(CqrsMetrics::default());
        let bus = Arc::new(EventBus::with_metrics(Arc::clone(&metrics)));
        Self::with_bus(bus, metrics)
    }

    /// Creates an engine publishing on an existing bus.
    pub fn with_bus(bus: Arc<EventBus>, metrics: Arc<CqrsMetrics>) -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
            queries: RwLock::new(HashMap::new()),
            bus,
            metrics,
        }
    }

    /// The bus events are published on.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Dispatch counters.
    pub fn metrics(&self) -> &Arc<CqrsMetrics> {
        &self.metrics
    }

    /// Registers a command handler.
    ///
    /// # Errors
    /// `CommandError::DuplicateHandler` if a handler with the same name is
    /// already registered for this type.
    pub fn register_command_handler(
        &self,
        command_type: CommandType,
        handler: Arc<dyn CommandHandler>,
    ) -> CommandResult<()> {
        let mut commands = self.commands.write();
        let handlers = commands.entry(command_type.clone()).or_default();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(CommandError::DuplicateHandler {
                command_type,
                handler: handler.name().to_string(),
            });
        }
        debug!(%command_type, handler = handler.name(), "command handler registered");
        handlers.push(handler);
        Ok(())
    }

    /// Registers a query handler.
    ///
    /// # Errors
    /// `QueryError::DuplicateHandler` if a handler with the same name is
    /// already registered for this type.
    pub fn register_query_handler(
        &self,
        query_type: QueryType,
        handler: Arc<dyn QueryHandler>,
    ) -> QueryResult<()> {
        let mut queries = self.queries.write();
        let handlers = queries.entry(query_type.clone()).or_default();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(QueryError::DuplicateHandler {
                query_type,
                handler: handler.name().to_string(),
            });
        }
        debug!(%query_type, handler = handler.name(), "query handler registered");
        handlers.push(handler);
        Ok(())
    }

    /// Subscribes an event handler to one event type.
    pub fn register_event_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.bus.subscribe(event_type, handler);
    }

    fn route_command(&self, command: &Command) -> CommandResult<Arc<dyn CommandHandler>> {
        let commands = self.commands.read();
        let claims: Vec<&Arc<dyn CommandHandler>> = commands
            .get(&command.command_type)
            .map(|handlers| handlers.iter().filter(|h| h.can_handle(command)).collect())
            .unwrap_or_default();
        match claims.as_slice() {
            [] => Err(CommandError::NoHandler(command.command_type.clone())),
            [handler] => Ok(Arc::clone(handler)),
            many => Err(CommandError::AmbiguousHandler {
                command_type: command.command_type.clone(),
                handlers: many.iter().map(|h| h.name().to_string()).collect(),
            }),
        }
    }

    fn route_query(&self, query: &Query) -> QueryResult<Arc<dyn QueryHandler>> {
        let queries = self.queries.read();
        let claims: Vec<&Arc<dyn QueryHandler>> = queries
            .get(&query.query_type)
            .map(|handlers| handlers.iter().filter(|h| h.can_handle(query)).collect())
            .unwrap_or_default();
        match claims.as_slice() {
            [] => Err(QueryError::NoHandler(query.query_type.clone())),
            [handler] => Ok(Arc::clone(handler)),
            many => Err(QueryError::AmbiguousHandler {
                query_type: query.query_type.clone(),
                handlers: many.iter().map(|h| h.name().to_string()).collect(),
            }),
        }
    }

    /// Routes the command to its single claiming handler, then publishes the
    /// returned events.
    #[instrument(
        skip(self, command),
        fields(
            command_id = %command.id,
            command_type = %command.command_type,
            aggregate_id = %command.aggregate_id
        )
    )]
    pub async fn execute_command(&self, command: Command) -> CommandResult<CommandOutcome> {
        self.metrics.commands.increment();
        let result = self
            .metrics
            .command_time
            .time_async(|| async {
                let handler = self.route_command(&command)?;
                handler.handle(&command).await
            })
            .await;

        let events = match result {
            Ok(events) => events,
            Err(error) => {
                self.metrics.command_failures.increment();
                debug!(%error, kind = %error.kind(), "command failed");
                return Err(error);
            }
        };

        let failed_deliveries = self.bus.publish_all(&events).await;
        debug!(
            events = events.len(),
            failed_deliveries = failed_deliveries.len(),
            "command executed"
        );
        Ok(CommandOutcome {
            events,
            failed_deliveries,
        })
    }

    /// Routes the query to its single claiming handler.
    #[instrument(skip(self, query), fields(query_id = %query.id, query_type = %query.query_type))]
    pub async fn execute_query(&self, query: Query) -> QueryResult<Value> {
        self.metrics.queries.increment();
        let result = self
            .metrics
            .query_time
            .time_async(|| async {
                let handler = self.route_query(&query)?;
                handler.handle(&query).await
            })
            .await;

        if let Err(error) = &result {
            self.metrics.query_failures.increment();
            debug!(%error, kind = %error.kind(), "query failed");
        }
        result
    }
}
