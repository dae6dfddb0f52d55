use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keystone::errors::{ShardError, ShardResult};
use keystone::sharding::{ShardConfig, ShardConnection, ShardConnectionFactory, ShardQuery};
use keystone::types::ShardId;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::debug;

/// A connection that records every statement it executes.
///
/// `SELECT 1` answers `1`. Statements with a canned response answer that
/// response; anything else answers
/// `{"shard": <id>, "statement": <text>, "params": [...]}`.
#[derive(Debug)]
pub struct InMemoryShardConnection {
    shard_id: ShardId,
    responses: Arc<RwLock<HashMap<String, Value>>>,
    executed: Mutex<Vec<ShardQuery>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryShardConnection {
    fn new(shard_id: ShardId, responses: Arc<RwLock<HashMap<String, Value>>>) -> Self {
        Self {
            shard_id,
            responses,
            executed: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The shard this connection serves.
    pub const fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Statements executed so far, oldest first.
    pub fn executed(&self) -> Vec<ShardQuery> {
        self.executed.lock().clone()
    }

    /// Makes every later statement fail, or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardConnection for InMemoryShardConnection {
    async fn execute(&self, query: &ShardQuery) -> ShardResult<Value> {
        if self.is_closed() {
            return Err(ShardError::Connection {
                shard_id: self.shard_id.clone(),
                message: "connection closed".to_string(),
            });
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ShardError::Query {
                shard_id: self.shard_id.clone(),
                message: format!("injected failure for '{}'", query.statement),
            });
        }
        self.executed.lock().push(query.clone());

        if query.statement == ShardQuery::ping().statement {
            return Ok(json!(1));
        }
        let canned = self.responses.read().get(&query.statement).cloned();
        Ok(canned.unwrap_or_else(|| {
            json!({
                "shard": self.shard_id.as_ref(),
                "statement": query.statement,
                "params": query.params,
            })
        }))
    }

    async fn close(&self) -> ShardResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(shard_id = %self.shard_id, "in-memory shard connection closed");
        Ok(())
    }
}

/// Opens [`InMemoryShardConnection`]s and keeps a handle to each.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShardConnectionFactory {
    connections: Arc<RwLock<HashMap<ShardId, Arc<InMemoryShardConnection>>>>,
    refused: Arc<RwLock<HashSet<ShardId>>>,
    responses: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemoryShardConnectionFactory {
    /// A factory that accepts every shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes connecting to `shard_id` fail.
    pub fn refuse(&self, shard_id: ShardId) {
        self.refused.write().insert(shard_id);
    }

    /// Answers `statement` with `response` on every shard.
    pub fn respond(&self, statement: impl Into<String>, response: Value) {
        self.responses.write().insert(statement.into(), response);
    }

    /// The most recent connection opened to `shard_id`.
    pub fn connection(&self, shard_id: &ShardId) -> Option<Arc<InMemoryShardConnection>> {
        self.connections.read().get(shard_id).cloned()
    }
}

#[async_trait]
impl ShardConnectionFactory for InMemoryShardConnectionFactory {
    async fn connect(&self, config: &ShardConfig) -> ShardResult<Arc<dyn ShardConnection>> {
        if self.refused.read().contains(&config.id) {
            return Err(ShardError::Connection {
                shard_id: config.id.clone(),
                message: format!("{}:{} refused the connection", config.host, config.port),
            });
        }
        let connection = Arc::new(InMemoryShardConnection::new(
            config.id.clone(),
            Arc::clone(&self.responses),
        ));
        self.connections
            .write()
            .insert(config.id.clone(), Arc::clone(&connection));
        Ok(connection)
    }
}
