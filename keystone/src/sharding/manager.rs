use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use super::strategy::{consistent_hash_name, ConsistentHashStrategy, HashStrategy};
use super::{
    BroadcastResult, DataMove, PlanKind, QueryPlan, ShardConfig, ShardConnection,
    ShardConnectionFactory, ShardQuery, ShardResponse, ShardingMetrics, ShardingStrategy,
};
use crate::config::{ShardingConfig, VirtualNodes};
use crate::errors::{ShardError, ShardResult};
use crate::types::{ShardId, StrategyName, Timestamp};

const COST_PER_SHARD: u64 = 10;

const ACTIVE: u8 = 0;
const INACTIVE: u8 = 1;
const RETIRED: u8 = 2;

/// A registered shard and its live connection.
struct ShardSlot {
    config: ShardConfig,
    connection: Arc<dyn ShardConnection>,
    state: AtomicU8,
    query_count: AtomicU64,
    error_count: AtomicU64,
    last_used: Mutex<Timestamp>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ShardSlot {
    fn new(config: ShardConfig, connection: Arc<dyn ShardConnection>) -> Self {
        Self {
            config,
            connection,
            state: AtomicU8::new(ACTIVE),
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_used: Mutex::new(Timestamp::now()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn id(&self) -> &ShardId {
        &self.config.id
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ACTIVE
    }

    /// Records a health result unless the shard was retired meanwhile.
    /// Returns the previous activity, or `None` for a retired shard.
    fn set_healthy(&self, healthy: bool) -> Option<bool> {
        let next = if healthy { ACTIVE } else { INACTIVE };
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state != RETIRED).then_some(next)
            })
            .ok()
            .map(|previous| previous == ACTIVE)
    }

    /// Takes the shard out of service for good, then waits for running
    /// queries and closes the connection.
    async fn retire(&self) {
        self.state.store(RETIRED, Ordering::SeqCst);
        self.drain().await;
        if let Err(error) = self.connection.close().await {
            warn!(shard_id = %self.id(), %error, "closing shard connection failed");
        }
    }

    fn enter(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight { slot: self }
    }

    /// Resolves once no query is running on the shard.
    async fn drain(&self) {
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Runs `query` if the shard is active. The in-flight count is raised
    /// before the state is read, so a drain never misses this query.
    async fn run(&self, query: &ShardQuery) -> ShardResult<Value> {
        let _guard = self.enter();
        if !self.is_active() {
            return Err(ShardError::ShardInactive(self.id().clone()));
        }
        self.query_count.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock() = Timestamp::now();
        let result = self.connection.execute(query).await;
        if result.is_err() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Counts a running query; the last one out wakes the drainer.
struct InFlight<'a> {
    slot: &'a ShardSlot,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.slot.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.slot.drained.notify_waiters();
        }
    }
}

#[derive(Debug, Default)]
struct QueryStats {
    total: u64,
    failed: u64,
    average_ms: f64,
    utilization: BTreeMap<ShardId, u64>,
}

impl QueryStats {
    fn record(&mut self, shard_id: Option<&ShardId>, elapsed: Duration, succeeded: bool) {
        self.total += 1;
        if !succeeded {
            self.failed += 1;
        }
        if let Some(shard_id) = shard_id {
            *self.utilization.entry(shard_id.clone()).or_default() += 1;
        }
        let millis = elapsed.as_secs_f64() * 1000.0;
        self.average_ms += (millis - self.average_ms) / self.total as f64;
    }
}

/// Routes queries to shards and tracks shard health and load.
///
/// The `hash` and `consistent_hash` strategies are always registered and
/// follow the topology as shards are added and removed. Other strategies
/// are registered with [`register_strategy`](Self::register_strategy) and
/// are told about topology changes from then on.
pub struct ShardManager {
    factory: Arc<dyn ShardConnectionFactory>,
    shards: RwLock<BTreeMap<ShardId, Arc<ShardSlot>>>,
    strategies: RwLock<HashMap<StrategyName, Arc<dyn ShardingStrategy>>>,
    default_strategy: RwLock<StrategyName>,
    stats: Mutex<QueryStats>,
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("shards", &self.shards.read().keys().collect::<Vec<_>>())
            .field("strategies", &self.strategies.read().keys().collect::<Vec<_>>())
            .field("default_strategy", &*self.default_strategy.read())
            .finish_non_exhaustive()
    }
}

impl ShardManager {
    /// An empty manager. The default strategy is `consistent_hash`.
    pub fn new(factory: Arc<dyn ShardConnectionFactory>, virtual_nodes: VirtualNodes) -> Self {
        let hash: Arc<dyn ShardingStrategy> = Arc::new(HashStrategy::new(Vec::new()));
        let ring: Arc<dyn ShardingStrategy> =
            Arc::new(ConsistentHashStrategy::new(Vec::new(), virtual_nodes));
        let strategies = [hash, ring]
            .into_iter()
            .map(|strategy| (strategy.name().clone(), strategy))
            .collect();
        Self {
            factory,
            shards: RwLock::new(BTreeMap::new()),
            strategies: RwLock::new(strategies),
            default_strategy: RwLock::new(consistent_hash_name()),
            stats: Mutex::new(QueryStats::default()),
        }
    }

    /// Builds a manager from configuration and connects its shards.
    ///
    /// Shards that fail to connect are logged and left out; a configured
    /// default strategy that is not built in is rejected.
    #[instrument(skip(config, factory), fields(shards = config.shards.len()))]
    pub async fn connect(
        config: &ShardingConfig,
        factory: Arc<dyn ShardConnectionFactory>,
    ) -> ShardResult<Self> {
        if !config.enabled {
            return Err(ShardError::Disabled);
        }
        let manager = Self::new(factory, config.virtual_nodes);
        for shard in &config.shards {
            if let Err(error) = manager.add_shard(shard.clone()).await {
                warn!(shard_id = %shard.id, %error, "shard left out of topology");
            }
        }
        manager.set_default_strategy(config.default_strategy.clone())?;
        Ok(manager)
    }

    /// Registers `strategy` under its name, replacing any previous one.
    pub fn register_strategy(&self, strategy: Arc<dyn ShardingStrategy>) {
        let name = strategy.name().clone();
        debug!(strategy = %name, "sharding strategy registered");
        self.strategies.write().insert(name, strategy);
    }

    /// Makes `name` the strategy used when a call names none.
    pub fn set_default_strategy(&self, name: StrategyName) -> ShardResult<()> {
        if !self.strategies.read().contains_key(&name) {
            return Err(ShardError::StrategyNotFound(name));
        }
        *self.default_strategy.write() = name;
        Ok(())
    }

    /// Name of the default strategy.
    pub fn default_strategy(&self) -> StrategyName {
        self.default_strategy.read().clone()
    }

    /// Ids of the registered shards, in order.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.read().keys().cloned().collect()
    }

    fn strategy(&self, name: Option<&StrategyName>) -> ShardResult<Arc<dyn ShardingStrategy>> {
        let name = name.cloned().unwrap_or_else(|| self.default_strategy());
        self.strategies
            .read()
            .get(&name)
            .cloned()
            .ok_or(ShardError::StrategyNotFound(name))
    }

    fn slot(&self, shard_id: &ShardId) -> Option<Arc<ShardSlot>> {
        self.shards.read().get(shard_id).cloned()
    }

    fn slots(&self) -> Vec<Arc<ShardSlot>> {
        self.shards.read().values().cloned().collect()
    }

    fn all_strategies(&self) -> Vec<Arc<dyn ShardingStrategy>> {
        self.strategies.read().values().cloned().collect()
    }

    /// Shard that owns `data` under `strategy` (or the default strategy).
    pub async fn get_shard_for_data(
        &self,
        data: &Value,
        strategy: Option<&StrategyName>,
    ) -> ShardResult<ShardId> {
        let strategy = self.strategy(strategy)?;
        let key = strategy.shard_key(data)?;
        strategy.shard_id(&key).await
    }

    async fn execute_on_slot(&self, slot: &ShardSlot, query: &ShardQuery) -> ShardResult<Value> {
        let started = Instant::now();
        let result = slot.run(query).await;
        self.stats
            .lock()
            .record(Some(slot.id()), started.elapsed(), result.is_ok());
        result
    }

    /// Runs `query` on one shard.
    #[instrument(skip(self, query), fields(statement = %query.statement))]
    pub async fn execute_on_shard(
        &self,
        shard_id: &ShardId,
        query: &ShardQuery,
    ) -> ShardResult<Value> {
        let Some(slot) = self.slot(shard_id) else {
            self.stats.lock().record(None, Duration::ZERO, false);
            return Err(ShardError::ShardNotFound(shard_id.clone()));
        };
        self.execute_on_slot(&slot, query).await
    }

    /// Runs `query` on every shard concurrently.
    ///
    /// Individual failures are reported in the result and never fail the
    /// broadcast as a whole.
    #[instrument(skip(self, query), fields(statement = %query.statement))]
    pub async fn execute_on_all_shards(&self, query: &ShardQuery) -> BroadcastResult {
        let slots = self.slots();
        let outcomes = join_all(slots.iter().map(|slot| async move {
            (slot.id().clone(), self.execute_on_slot(slot, query).await)
        }))
        .await;

        let mut broadcast = BroadcastResult::default();
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(value) => {
                    broadcast.results.insert(shard_id, value);
                }
                Err(error) => {
                    warn!(%shard_id, %error, "shard failed during broadcast");
                    broadcast.failures.insert(shard_id, error);
                }
            }
        }
        broadcast
    }

    /// Runs `query` on the shard owning `data`, or on every shard when no
    /// data is given.
    pub async fn execute_query(
        &self,
        query: &ShardQuery,
        data: Option<&Value>,
        strategy: Option<&StrategyName>,
    ) -> ShardResult<ShardResponse> {
        match data {
            Some(data) => {
                let shard_id = match self.get_shard_for_data(data, strategy).await {
                    Ok(shard_id) => shard_id,
                    Err(error) => {
                        self.stats.lock().record(None, Duration::ZERO, false);
                        return Err(error);
                    }
                };
                let value = self.execute_on_shard(&shard_id, query).await?;
                Ok(ShardResponse::Single { shard_id, value })
            }
            None => Ok(ShardResponse::Broadcast(
                self.execute_on_all_shards(query).await,
            )),
        }
    }

    /// Shards a query for `data` would touch, without running it.
    pub async fn create_query_plan(
        &self,
        data: Option<&Value>,
        strategy: Option<&StrategyName>,
    ) -> ShardResult<QueryPlan> {
        let (shards, kind) = match data {
            Some(data) => (
                vec![self.get_shard_for_data(data, strategy).await?],
                PlanKind::Single,
            ),
            None => (self.shard_ids(), PlanKind::Broadcast),
        };
        let touched = u64::try_from(shards.len()).unwrap_or(u64::MAX);
        Ok(QueryPlan {
            aggregation_required: kind == PlanKind::Broadcast && shards.len() > 1,
            estimated_cost: touched.saturating_mul(COST_PER_SHARD),
            shards,
            kind,
        })
    }

    /// Items whose placement under `to` differs from their placement under
    /// `from`. Nothing is moved; the caller performs the copies.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn redistribute_data(
        &self,
        items: &[Value],
        from: &StrategyName,
        to: &StrategyName,
    ) -> ShardResult<Vec<DataMove>> {
        let source = self.strategy(Some(from))?;
        let target = self.strategy(Some(to))?;
        let mut moves = Vec::new();
        for item in items {
            let key = source.shard_key(item)?;
            let current = source.shard_id(&key).await?;
            let next = target.shard_id(&target.shard_key(item)?).await?;
            if current != next {
                moves.push(DataMove {
                    key,
                    from: current,
                    to: next,
                });
            }
        }
        info!(moves = moves.len(), "redistribution planned");
        Ok(moves)
    }

    /// Pings every shard concurrently and marks each active or inactive.
    /// Shards removed while the ping runs are left out.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> BTreeMap<ShardId, bool> {
        let slots = self.slots();
        let probes = join_all(slots.iter().map(|slot| async move {
            let _guard = slot.enter();
            let healthy = match slot.connection.execute(&ShardQuery::ping()).await {
                Ok(_) => true,
                Err(error) => {
                    slot.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(shard_id = %slot.id(), %error, "shard health check failed");
                    false
                }
            };
            let Some(was_active) = slot.set_healthy(healthy) else {
                return None;
            };
            if was_active != healthy {
                info!(shard_id = %slot.id(), healthy, "shard health changed");
            }
            Some((slot.id().clone(), healthy))
        }))
        .await;
        probes.into_iter().flatten().collect()
    }

    /// Query and topology metrics.
    pub fn metrics(&self) -> ShardingMetrics {
        let slots = self.slots();
        let stats = self.stats.lock();
        ShardingMetrics {
            total_queries: stats.total,
            failed_queries: stats.failed,
            total_shards: slots.len(),
            active_connections: slots.iter().filter(|slot| slot.is_active()).count(),
            average_response_time_ms: stats.average_ms,
            shard_utilization: stats.utilization.clone(),
            error_rate: if stats.total == 0 {
                0.0
            } else {
                stats.failed as f64 / stats.total as f64
            },
        }
    }

    /// Connects a new shard and adds it to every strategy.
    #[instrument(skip(self, config), fields(shard_id = %config.id))]
    pub async fn add_shard(&self, config: ShardConfig) -> ShardResult<()> {
        if self.shards.read().contains_key(&config.id) {
            return Err(ShardError::DuplicateShard(config.id));
        }
        let connection = self.factory.connect(&config).await?;
        let shard_id = config.id.clone();
        {
            let mut shards = self.shards.write();
            if shards.contains_key(&shard_id) {
                return Err(ShardError::DuplicateShard(shard_id));
            }
            shards.insert(shard_id.clone(), Arc::new(ShardSlot::new(config, connection)));
        }
        for strategy in self.all_strategies() {
            strategy.on_shard_added(&shard_id);
        }
        info!("shard added");
        Ok(())
    }

    /// Removes a shard from routing, waits for its running queries to
    /// finish, then closes its connection.
    #[instrument(skip(self))]
    pub async fn remove_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        let slot = self
            .shards
            .write()
            .remove(shard_id)
            .ok_or_else(|| ShardError::ShardNotFound(shard_id.clone()))?;
        for strategy in self.all_strategies() {
            strategy.on_shard_removed(shard_id);
        }
        slot.retire().await;
        info!(
            queries = slot.query_count.load(Ordering::Relaxed),
            errors = slot.error_count.load(Ordering::Relaxed),
            "shard removed"
        );
        Ok(())
    }

    /// Drains and closes every shard connection.
    pub async fn close_all(&self) {
        let slots: Vec<Arc<ShardSlot>> = std::mem::take(&mut *self.shards.write())
            .into_values()
            .collect();
        for slot in slots {
            for strategy in self.all_strategies() {
                strategy.on_shard_removed(slot.id());
            }
            slot.retire().await;
        }
    }

    /// When each shard last ran a query.
    pub fn last_used(&self) -> BTreeMap<ShardId, Timestamp> {
        self.shards
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), *slot.last_used.lock()))
            .collect()
    }
}
