//! Error types for the coordination layer.
//!
//! Each subsystem owns a `thiserror` enum. Every error can report which broad
//! category it belongs to through [`ErrorKind`], so callers can decide whether
//! to retry, escalate or give up without matching on every variant:
//!
//! - **Routing**: no handler, several handlers, unknown strategy. Never retried.
//! - **`ConcurrencyConflict`**: `expected_version` did not match. Reload and retry.
//! - **`SagaStep`**: a step or compensation action failed.
//! - **Unavailable**: no healthy instance, shard missing or inactive, circuit open.
//! - **Projection**: a projection handler failed; isolated to that projection.
//! - **`HealthCheck`**: a health probe failed; converted to an unhealthy flag.
//! - **Validation**: bad input or configuration.
//! - **Internal**: a bug or an unexpected backend failure.
//!
//! # Example
//!
//! ```rust,ignore
//! match engine.execute_command(command).await {
//!     Ok(outcome) => publish(outcome.events),
//!     Err(error) if error.is_retryable() => retry_with_fresh_state().await?,
//!     Err(error) => return Err(error.into()),
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::saga::SagaStatus;
use crate::types::{
    AggregateId, CommandType, EventId, EventVersion, InstanceId, ProjectionName, QueryType,
    SagaDefinitionId, SagaId, ServiceId, ShardId, StepName, StrategyName,
};

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No handler, several handlers, or an unknown routing target.
    Routing,
    /// Optimistic concurrency check failed.
    ConcurrencyConflict,
    /// A saga step or compensation failed.
    SagaStep,
    /// A shard or service could not serve the request.
    Unavailable,
    /// A projection handler failed.
    Projection,
    /// A health probe failed.
    HealthCheck,
    /// Input or configuration was invalid.
    Validation,
    /// Unexpected internal failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Routing => "routing",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::SagaStep => "saga_step",
            Self::Unavailable => "unavailable",
            Self::Projection => "projection",
            Self::HealthCheck => "health_check",
            Self::Validation => "validation",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Errors raised by an event store backend.
///
/// `VersionConflict` is the optimistic concurrency signal: another writer
/// appended to the aggregate after the caller read it. Nothing was written.
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// The aggregate's current version differs from the expected one.
    #[error(
        "Version conflict on aggregate '{aggregate_id}': expected {expected}, but current is {current}"
    )]
    VersionConflict {
        /// The aggregate with the conflict
        aggregate_id: AggregateId,
        /// The version the writer expected
        expected: EventVersion,
        /// The version actually stored
        current: EventVersion,
    },

    /// Events in a batch are not numbered `expected + 1 ..= expected + n`.
    #[error("Invalid event sequence for aggregate '{aggregate_id}': expected version {expected}, got {actual}")]
    InvalidEventSequence {
        /// The aggregate being written
        aggregate_id: AggregateId,
        /// The version the event should have carried
        expected: EventVersion,
        /// The version it carried
        actual: EventVersion,
    },

    /// An event in the batch belongs to a different aggregate.
    #[error("Event for aggregate '{actual}' submitted to stream '{expected}'")]
    AggregateMismatch {
        /// The stream being written
        expected: AggregateId,
        /// The aggregate id carried by the event
        actual: AggregateId,
    },

    /// An event with this id already exists.
    #[error("Duplicate event ID: {0}")]
    DuplicateEventId(EventId),

    /// The backend does not implement this optional operation.
    #[error("Operation not supported by this event store: {0}")]
    Unsupported(String),

    /// The backend could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// State could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The backend did not answer in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected backend failure.
    #[error("Internal event store error: {0}")]
    Internal(String),
}

impl EventStoreError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::VersionConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::InvalidEventSequence { .. }
            | Self::AggregateMismatch { .. }
            | Self::DuplicateEventId(_) => ErrorKind::Validation,
            Self::ConnectionFailed(_) | Self::Timeout(_) => ErrorKind::Unavailable,
            Self::Unsupported(_) | Self::SerializationFailed(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether retrying the operation can succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::ConnectionFailed(_) | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerializationFailed(error.to_string())
    }
}

/// Errors raised while routing or executing a command.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// No registered handler claimed the command.
    #[error("No handler claimed command of type '{0}'")]
    NoHandler(CommandType),

    /// More than one registered handler claimed the command.
    #[error("Command of type '{command_type}' claimed by several handlers: {handlers:?}")]
    AmbiguousHandler {
        /// The command type
        command_type: CommandType,
        /// Names of the claiming handlers
        handlers: Vec<String>,
    },

    /// A handler with the same name is already registered for this type.
    #[error("Handler '{handler}' is already registered for command type '{command_type}'")]
    DuplicateHandler {
        /// The command type
        command_type: CommandType,
        /// The handler name
        handler: String,
    },

    /// Optimistic concurrency control rejected the write.
    #[error("Concurrency conflict on aggregate '{aggregate_id}': expected {expected}, current {current}")]
    ConcurrencyConflict {
        /// The aggregate with the conflict
        aggregate_id: AggregateId,
        /// The version the handler loaded
        expected: EventVersion,
        /// The version actually stored
        current: EventVersion,
    },

    /// The command payload is malformed.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// A business rule rejected the command.
    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),

    /// The event store failed.
    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoHandler(_) | Self::AmbiguousHandler { .. } => ErrorKind::Routing,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::DuplicateHandler { .. }
            | Self::ValidationFailed(_)
            | Self::BusinessRuleViolation(_) => ErrorKind::Validation,
            Self::EventStore(error) => error.kind(),
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the command (after reloading state) can succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict { .. } => true,
            Self::EventStore(error) => error.is_retryable(),
            _ => false,
        }
    }
}

impl From<EventStoreError> for CommandError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::VersionConflict {
                aggregate_id,
                expected,
                current,
            } => Self::ConcurrencyConflict {
                aggregate_id,
                expected,
                current,
            },
            other => Self::EventStore(other),
        }
    }
}

/// Errors raised while routing or executing a query.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// No registered handler claimed the query.
    #[error("No handler claimed query of type '{0}'")]
    NoHandler(QueryType),

    /// More than one registered handler claimed the query.
    #[error("Query of type '{query_type}' claimed by several handlers: {handlers:?}")]
    AmbiguousHandler {
        /// The query type
        query_type: QueryType,
        /// Names of the claiming handlers
        handlers: Vec<String>,
    },

    /// A handler with the same name is already registered for this type.
    #[error("Handler '{handler}' is already registered for query type '{query_type}'")]
    DuplicateHandler {
        /// The query type
        query_type: QueryType,
        /// The handler name
        handler: String,
    },

    /// The query parameters are malformed.
    #[error("Invalid query parameters: {0}")]
    InvalidParameters(String),

    /// The event store failed while serving the query.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The handler failed.
    #[error("Query failed: {0}")]
    Failed(String),
}

impl QueryError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoHandler(_) | Self::AmbiguousHandler { .. } => ErrorKind::Routing,
            Self::DuplicateHandler { .. } | Self::InvalidParameters(_) => ErrorKind::Validation,
            Self::EventStore(error) => error.kind(),
            Self::Failed(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the query can succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::EventStore(error) => error.is_retryable(),
            _ => false,
        }
    }
}

/// Errors raised by the projection manager.
#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// A projection with this name is already registered.
    #[error("Projection '{0}' is already registered")]
    DuplicateProjection(ProjectionName),

    /// No projection with this name is registered.
    #[error("Projection '{0}' not found")]
    NotFound(ProjectionName),

    /// A projection handler failed on an event.
    #[error("Projection '{projection}' failed on event {event_id}: {message}")]
    HandlerFailed {
        /// The failing projection
        projection: ProjectionName,
        /// The event being folded
        event_id: EventId,
        /// The handler's error message
        message: String,
    },

    /// The handler rejected an event without further context.
    #[error("Projection handler error: {0}")]
    Handler(String),

    /// Reading the event history failed.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

impl ProjectionError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateProjection(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::Routing,
            Self::HandlerFailed { .. } | Self::Handler(_) => ErrorKind::Projection,
            Self::EventStore(error) => error.kind(),
        }
    }

    /// Whether retrying can succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::EventStore(error) => error.is_retryable(),
            _ => false,
        }
    }
}

/// Errors raised by a saga action executor.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// No function is registered under this name.
    #[error("No saga function registered as '{0}'")]
    FunctionNotFound(String),

    /// The action ran and failed.
    #[error("Action failed: {0}")]
    Failed(String),

    /// The attempt exceeded its timeout.
    #[error("Action timed out after {0:?}")]
    Timeout(Duration),

    /// A command action failed.
    #[error("Command action failed: {0}")]
    Command(#[from] CommandError),

    /// A service action failed.
    #[error("Service action failed: {0}")]
    Mesh(#[from] MeshError),

    /// The executor cannot run this kind of action.
    #[error("Unsupported action: {0}")]
    Unsupported(String),
}

impl ActionError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::FunctionNotFound(_) | Self::Unsupported(_) => ErrorKind::Routing,
            Self::Failed(_) | Self::Timeout(_) => ErrorKind::SagaStep,
            Self::Command(error) => error.kind(),
            Self::Mesh(error) => error.kind(),
        }
    }
}

/// Errors raised by the saga orchestrator.
#[derive(Debug, Clone, Error)]
pub enum SagaError {
    /// No saga instance with this id exists.
    #[error("Saga {0} not found")]
    NotFound(SagaId),

    /// No definition is registered under this id.
    #[error("Saga definition '{0}' not found")]
    DefinitionNotFound(SagaDefinitionId),

    /// A definition failed validation.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The operation is not allowed in the saga's current status.
    #[error("Cannot {operation} saga {saga_id} while it is {status}")]
    InvalidState {
        /// The saga
        saga_id: SagaId,
        /// Its current status
        status: SagaStatus,
        /// The rejected operation
        operation: &'static str,
    },

    /// A step exhausted its retries.
    #[error("Step '{step}' of saga {saga_id} failed after {attempts} attempt(s): {message}")]
    StepFailed {
        /// The saga
        saga_id: SagaId,
        /// The failing step
        step: StepName,
        /// Number of attempts made
        attempts: u32,
        /// The last action error
        message: String,
    },

    /// The saga repository failed.
    #[error("Saga repository error: {0}")]
    Repository(String),

    /// Sagas are disabled by configuration.
    #[error("Saga orchestration is disabled")]
    Disabled,
}

impl SagaError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::DefinitionNotFound(_) => ErrorKind::Routing,
            Self::InvalidDefinition(_) | Self::InvalidState { .. } | Self::Disabled => {
                ErrorKind::Validation
            }
            Self::StepFailed { .. } => ErrorKind::SagaStep,
            Self::Repository(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying can succeed.
    pub const fn is_retryable(&self) -> bool {
        false
    }
}

/// Errors raised by the shard manager and its strategies.
#[derive(Debug, Clone, Error)]
pub enum ShardError {
    /// No shard with this id is registered.
    #[error("Shard '{0}' not found")]
    ShardNotFound(ShardId),

    /// The shard failed its last health check or is draining.
    #[error("Shard '{0}' is not active")]
    ShardInactive(ShardId),

    /// A shard with this id is already registered.
    #[error("Shard '{0}' is already registered")]
    DuplicateShard(ShardId),

    /// The topology is empty.
    #[error("No shards available")]
    NoShards,

    /// No strategy is registered under this name.
    #[error("Sharding strategy '{0}' not found")]
    StrategyNotFound(StrategyName),

    /// No configured range covers the key.
    #[error("No shard range covers key '{key}'")]
    NoRangeForKey {
        /// The unplaced key
        key: String,
    },

    /// The key could not be extracted from the data or is malformed.
    #[error("Invalid shard key: {0}")]
    InvalidKey(String),

    /// The directory lookup service failed.
    #[error("Directory lookup failed for key '{key}': {message}")]
    Lookup {
        /// The key being resolved
        key: String,
        /// The lookup failure
        message: String,
    },

    /// Opening or using the shard connection failed.
    #[error("Connection to shard '{shard_id}' failed: {message}")]
    Connection {
        /// The shard
        shard_id: ShardId,
        /// The connection failure
        message: String,
    },

    /// The query failed on the shard.
    #[error("Query on shard '{shard_id}' failed: {message}")]
    Query {
        /// The shard
        shard_id: ShardId,
        /// The query failure
        message: String,
    },

    /// Sharding is disabled by configuration.
    #[error("Sharding is disabled")]
    Disabled,
}

impl ShardError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ShardNotFound(_)
            | Self::ShardInactive(_)
            | Self::NoShards
            | Self::Connection { .. }
            | Self::Lookup { .. } => ErrorKind::Unavailable,
            Self::StrategyNotFound(_) | Self::NoRangeForKey { .. } => ErrorKind::Routing,
            Self::DuplicateShard(_) | Self::InvalidKey(_) | Self::Disabled => {
                ErrorKind::Validation
            }
            Self::Query { .. } => ErrorKind::Internal,
        }
    }

    /// Whether retrying can succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Lookup { .. })
    }
}

/// Errors raised by the service mesh.
#[derive(Debug, Clone, Error)]
pub enum MeshError {
    /// The service is not registered.
    #[error("Service '{0}' not found")]
    ServiceNotFound(ServiceId),

    /// The service is already registered.
    #[error("Service '{0}' is already registered")]
    DuplicateService(ServiceId),

    /// The instance is not registered for this service.
    #[error("Instance '{instance_id}' of service '{service_id}' not found")]
    InstanceNotFound {
        /// The service
        service_id: ServiceId,
        /// The instance
        instance_id: InstanceId,
    },

    /// No instance of the service is currently healthy.
    #[error("No healthy instances available for service '{0}'")]
    NoHealthyInstances(ServiceId),

    /// The service's circuit breaker is open.
    #[error("Circuit breaker is open for service '{0}'")]
    CircuitOpen(ServiceId),

    /// The request exceeded its timeout.
    #[error("Request to service '{service_id}' timed out after {timeout:?}")]
    Timeout {
        /// The service
        service_id: ServiceId,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The transport failed before a response arrived.
    #[error("Transport error calling service '{service_id}': {message}")]
    Transport {
        /// The service
        service_id: ServiceId,
        /// The transport failure
        message: String,
    },

    /// The instance answered with a server error status.
    #[error("Service '{service_id}' answered with status {status}")]
    ServerError {
        /// The service
        service_id: ServiceId,
        /// The response status
        status: u16,
    },

    /// A health probe failed.
    #[error("Health check of instance '{instance_id}' failed: {message}")]
    HealthCheck {
        /// The probed instance
        instance_id: InstanceId,
        /// The probe failure
        message: String,
    },

    /// A service or instance description is unusable.
    #[error("Invalid service definition: {0}")]
    InvalidDefinition(String),

    /// The service mesh is disabled by configuration.
    #[error("Service mesh is disabled")]
    Disabled,
}

impl MeshError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ServiceNotFound(_)
            | Self::NoHealthyInstances(_)
            | Self::CircuitOpen(_)
            | Self::Timeout { .. }
            | Self::Transport { .. }
            | Self::ServerError { .. } => ErrorKind::Unavailable,
            Self::InstanceNotFound { .. } => ErrorKind::Routing,
            Self::DuplicateService(_) | Self::InvalidDefinition(_) | Self::Disabled => {
                ErrorKind::Validation
            }
            Self::HealthCheck { .. } => ErrorKind::HealthCheck,
        }
    }

    /// Whether the failure is a transient transport failure worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transport { .. } | Self::ServerError { .. }
        )
    }
}

/// Errors raised when validating input or configuration.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// A field has an invalid value.
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue {
        /// The field
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// A document could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ValidationError {
    /// Creates an `InvalidValue` error.
    pub fn invalid(field: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.to_string(),
        }
    }

    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Facade-level error that wraps every subsystem error.
#[derive(Debug, Clone, Error)]
pub enum CoordinationError {
    /// Event store failure.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    /// Command failure.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Query failure.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// Projection failure.
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    /// Saga failure.
    #[error(transparent)]
    Saga(#[from] SagaError),
    /// Sharding failure.
    #[error(transparent)]
    Shard(#[from] ShardError),
    /// Service mesh failure.
    #[error(transparent)]
    Mesh(#[from] MeshError),
    /// Validation failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl CoordinationError {
    /// The category of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EventStore(error) => error.kind(),
            Self::Command(error) => error.kind(),
            Self::Query(error) => error.kind(),
            Self::Projection(error) => error.kind(),
            Self::Saga(error) => error.kind(),
            Self::Shard(error) => error.kind(),
            Self::Mesh(error) => error.kind(),
            Self::Validation(error) => error.kind(),
        }
    }

    /// Whether retrying can succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::EventStore(error) => error.is_retryable(),
            Self::Command(error) => error.is_retryable(),
            Self::Query(error) => error.is_retryable(),
            Self::Projection(error) => error.is_retryable(),
            Self::Saga(error) => error.is_retryable(),
            Self::Shard(error) => error.is_retryable(),
            Self::Mesh(error) => error.is_retryable(),
            Self::Validation(_) => false,
        }
    }
}

/// Result type for event store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Result type for command execution.
pub type CommandResult<T> = Result<T, CommandError>;

/// Result type for query execution.
pub type QueryResult<T> = Result<T, QueryError>;

/// Result type for projection operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;

/// Result type for saga operations.
pub type SagaResult<T> = Result<T, SagaError>;

/// Result type for saga actions.
pub type ActionResult<T> = Result<T, ActionError>;

/// Result type for sharding operations.
pub type ShardResult<T> = Result<T, ShardError>;

/// Result type for service mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Result type for facade operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
