//! Horizontal partitioning of data across shards.
//!
//! A [`ShardingStrategy`] turns a data item into a shard key and a shard key
//! into a [`ShardId`]. The [`ShardManager`] owns one long-lived connection
//! per shard (opened through an application supplied
//! [`ShardConnectionFactory`]), routes queries with the chosen strategy,
//! broadcasts key-less queries to every shard, and keeps per-shard metrics.

mod manager;
pub mod strategy;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ShardError, ShardResult};
use crate::types::ShardId;

pub use manager::ShardManager;
pub use strategy::{
    ConsistentHashStrategy, DirectoryLookup, DirectoryStrategy, HashStrategy, RangeStrategy,
    ShardRange, ShardingStrategy,
};

/// Static description of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Shard id
    pub id: ShardId,
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Relative capacity, for strategies that weigh shards
    #[serde(default)]
    pub weight: Option<u32>,
    /// Connection limit the factory should honour
    #[serde(default)]
    pub max_connections: Option<u32>,
    /// Whether this is a primary (writable) shard
    #[serde(default)]
    pub is_primary: bool,
    /// Deployment region
    #[serde(default)]
    pub region: Option<String>,
}

impl ShardConfig {
    /// A primary shard without weight or region.
    pub fn new(id: ShardId, host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            database: database.into(),
            weight: None,
            max_connections: None,
            is_primary: true,
            region: None,
        }
    }
}

/// A statement and its parameters, executed on one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardQuery {
    /// Backend specific statement text
    pub statement: String,
    /// Positional parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

impl ShardQuery {
    /// A statement without parameters.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            params: Vec::new(),
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// The trivial statement used by health checks.
    pub fn ping() -> Self {
        Self::new("SELECT 1")
    }
}

/// A live connection to one shard.
#[async_trait]
pub trait ShardConnection: Send + Sync {
    /// Runs `query` and returns its result.
    async fn execute(&self, query: &ShardQuery) -> ShardResult<Value>;

    /// Releases the connection.
    async fn close(&self) -> ShardResult<()> {
        Ok(())
    }
}

/// Opens shard connections. Supplied by the embedding application.
#[async_trait]
pub trait ShardConnectionFactory: Send + Sync {
    /// Connects to the shard described by `config`.
    async fn connect(&self, config: &ShardConfig) -> ShardResult<Arc<dyn ShardConnection>>;
}

/// Outcome of a query sent to every shard.
///
/// A failing shard does not fail the broadcast; its error is reported in
/// `failures` instead.
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Results of the shards that answered
    pub results: BTreeMap<ShardId, Value>,
    /// Errors of the shards that did not
    pub failures: BTreeMap<ShardId, ShardError>,
}

impl BroadcastResult {
    /// Whether every shard answered.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of [`ShardManager::execute_query`].
#[derive(Debug, Clone)]
pub enum ShardResponse {
    /// The query was routed to one shard.
    Single {
        /// The shard that answered
        shard_id: ShardId,
        /// Its result
        value: Value,
    },
    /// The query was broadcast to every shard.
    Broadcast(BroadcastResult),
}

/// How a query will be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// One shard
    Single,
    /// Every shard, results to be aggregated by the caller
    Broadcast,
}

/// Shards a query would touch, and its estimated cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Target shards
    pub shards: Vec<ShardId>,
    /// Execution kind
    pub kind: PlanKind,
    /// Whether the caller must merge several results
    pub aggregation_required: bool,
    /// Relative cost, 10 per shard touched
    pub estimated_cost: u64,
}

/// One item whose placement differs between two strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMove {
    /// The item's shard key under the source strategy
    pub key: String,
    /// Current shard
    pub from: ShardId,
    /// Shard under the target strategy
    pub to: ShardId,
}

/// Shard manager metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardingMetrics {
    /// Queries executed, including failed ones
    pub total_queries: u64,
    /// Queries that failed
    pub failed_queries: u64,
    /// Registered shards
    pub total_shards: usize,
    /// Shards currently accepting queries
    pub active_connections: usize,
    /// Running mean of query time in milliseconds
    pub average_response_time_ms: f64,
    /// Queries routed to each shard
    pub shard_utilization: BTreeMap<ShardId, u64>,
    /// `failed_queries / total_queries`
    pub error_rate: f64,
}
