//! In-memory adapters for the Keystone coordination layer
//!
//! Every port of the core crate has an implementation here that keeps its
//! state in process memory: events and snapshots, saga instances, shard
//! connections, and the mesh transport with its health probe. They honour
//! the same contracts as production backends, which makes them suitable
//! for tests and local development where persistence is not required.
//!
//! Clones of an adapter share their state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event_store;
mod mesh;
mod saga_repository;
mod shards;

pub use event_store::InMemoryEventStore;
pub use mesh::{InMemoryTransport, StaticHealthProbe, TransportBehaviour};
pub use saga_repository::InMemorySagaRepository;
pub use shards::{InMemoryShardConnection, InMemoryShardConnectionFactory};
