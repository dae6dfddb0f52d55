//! Keystone - a coordination layer for event-sourced services
//!
//! Commands are routed to exactly one handler, which loads an aggregate from
//! the event store, raises events and commits them under an optimistic
//! concurrency check. Committed events are published to subscribers and
//! folded into projections. Multi-step work runs as sagas with per-step
//! retry and reverse-order compensation. Sharded data is addressed through
//! pluggable placement strategies, and remote services are reached through a
//! mesh client with discovery, health checks, load balancing and circuit
//! breaking.
//!
//! Storage and transport are ports: [`event_store::EventStore`],
//! [`saga::SagaRepository`], [`sharding::ShardConnectionFactory`],
//! [`mesh::ServiceTransport`] and [`mesh::HealthProbe`]. The
//! `keystone-memory` crate provides in-memory adapters; the `http` feature
//! adds a `reqwest` transport.
//!
//! [`facade::EnterpriseCoordinator`] assembles all of it from a
//! [`config::CoordinationConfig`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod audit;
pub mod config;
pub mod cqrs;
pub mod errors;
pub mod event_sourcing;
pub mod event_store;
pub mod facade;
pub mod hash;
pub mod mesh;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod projection;
pub mod retry;
pub mod saga;
pub mod sharding;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use aggregate::{Aggregate, AggregateCommandHandler, AggregateRoot};
pub use audit::{AuditReport, AuditTrail};
pub use config::CoordinationConfig;
pub use cqrs::{CommandHandler, CommandOutcome, CqrsEngine, EventBus, EventHandler, QueryHandler};
pub use errors::{
    CommandError, CoordinationError, CoordinationResult, ErrorKind, EventStoreError, MeshError,
    ProjectionError, QueryError, SagaError, ShardError, ValidationError,
};
pub use event_sourcing::EventSourcingEngine;
pub use event_store::EventStore;
pub use facade::{Alert, CoordinatorBuilder, EnterpriseCoordinator};
pub use message::{Command, Event, EventFilter, EventStream, Query, Snapshot};
pub use metrics::EnterpriseMetrics;
pub use projection::{ProjectionHandler, ProjectionManager};
pub use retry::RetryPolicy;
pub use saga::{SagaDefinition, SagaDefinitionBuilder, SagaInstance, SagaOrchestrator, SagaStatus};
pub use sharding::ShardManager;
pub use types::{AggregateId, EventId, EventType, EventVersion, Timestamp};
