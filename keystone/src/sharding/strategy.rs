//! Sharding strategies.
//!
//! | Strategy | Placement | Topology changes |
//! |----------|-----------|------------------|
//! | [`HashStrategy`] | `hash(key) mod N` | most keys move |
//! | [`ConsistentHashStrategy`] | next virtual node on a ring | about `1/N` of keys move |
//! | [`RangeStrategy`] | `[min, max)` table | not tracked |
//! | [`DirectoryStrategy`] | explicit key to shard map | explicit |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::VirtualNodes;
use crate::errors::{ShardError, ShardResult};
use crate::hash::{bucket, stable_hash};
use crate::types::{ShardId, StrategyName};

fn builtin_name(name: &str) -> StrategyName {
    StrategyName::try_new(name).expect("built-in strategy names are valid")
}

/// Name of the [`HashStrategy`] registered by default.
pub fn hash_name() -> StrategyName {
    builtin_name("hash")
}

/// Name of the [`ConsistentHashStrategy`] registered by default.
pub fn consistent_hash_name() -> StrategyName {
    builtin_name("consistent_hash")
}

/// Default name of a [`RangeStrategy`].
pub fn range_name() -> StrategyName {
    builtin_name("range")
}

/// Default name of a [`DirectoryStrategy`].
pub fn directory_name() -> StrategyName {
    builtin_name("directory")
}

/// Shard key of `data`: a string is its own key, an object with an `id`
/// field is keyed by that id, anything else by its JSON text.
pub fn default_shard_key(data: &Value) -> String {
    match data {
        Value::String(key) => key.clone(),
        Value::Object(fields) => match fields.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(id) if !id.is_null() => id.to_string(),
            _ => data.to_string(),
        },
        _ => data.to_string(),
    }
}

/// Places data items on shards.
///
/// Strategies that depend on the set of shards are told about topology
/// changes through [`on_shard_added`](Self::on_shard_added) and
/// [`on_shard_removed`](Self::on_shard_removed).
#[async_trait]
pub trait ShardingStrategy: Send + Sync {
    /// Name the strategy is registered under.
    fn name(&self) -> &StrategyName;

    /// Shard key of a data item.
    fn shard_key(&self, data: &Value) -> ShardResult<String> {
        Ok(default_shard_key(data))
    }

    /// Shard owning `key`.
    async fn shard_id(&self, key: &str) -> ShardResult<ShardId>;

    /// A shard joined the topology.
    fn on_shard_added(&self, _shard_id: &ShardId) {}

    /// A shard left the topology.
    fn on_shard_removed(&self, _shard_id: &ShardId) {}
}

/// `stable_hash(key) mod N` over the sorted shard ids.
#[derive(Debug)]
pub struct HashStrategy {
    name: StrategyName,
    shards: RwLock<Vec<ShardId>>,
}

impl HashStrategy {
    /// A hash strategy over `shards`.
    pub fn new(shards: impl IntoIterator<Item = ShardId>) -> Self {
        let mut shards: Vec<ShardId> = shards.into_iter().collect();
        shards.sort();
        shards.dedup();
        Self {
            name: hash_name(),
            shards: RwLock::new(shards),
        }
    }

    /// Shard owning `key`, computed synchronously.
    pub fn place(&self, key: &str) -> ShardResult<ShardId> {
        let shards = self.shards.read();
        bucket(key, shards.len())
            .and_then(|index| shards.get(index).cloned())
            .ok_or(ShardError::NoShards)
    }
}

#[async_trait]
impl ShardingStrategy for HashStrategy {
    fn name(&self) -> &StrategyName {
        &self.name
    }

    async fn shard_id(&self, key: &str) -> ShardResult<ShardId> {
        self.place(key)
    }

    fn on_shard_added(&self, shard_id: &ShardId) {
        let mut shards = self.shards.write();
        if let Err(position) = shards.binary_search(shard_id) {
            shards.insert(position, shard_id.clone());
        }
    }

    fn on_shard_removed(&self, shard_id: &ShardId) {
        self.shards.write().retain(|id| id != shard_id);
    }
}

/// Hash ring with a fixed number of virtual nodes per shard.
///
/// A key belongs to the first virtual node at or after its hash, wrapping
/// around to the start of the ring. Virtual node `i` of shard `s` sits at
/// `stable_hash("s:i")`.
#[derive(Debug)]
pub struct ConsistentHashStrategy {
    name: StrategyName,
    virtual_nodes: usize,
    ring: RwLock<BTreeMap<u64, ShardId>>,
}

impl ConsistentHashStrategy {
    /// A ring holding `shards`.
    pub fn new(shards: impl IntoIterator<Item = ShardId>, virtual_nodes: VirtualNodes) -> Self {
        let strategy = Self {
            name: consistent_hash_name(),
            virtual_nodes: virtual_nodes.into_inner(),
            ring: RwLock::new(BTreeMap::new()),
        };
        for shard in shards {
            strategy.add_shard(&shard);
        }
        strategy
    }

    fn node_positions<'a>(&self, shard_id: &'a ShardId) -> impl Iterator<Item = u64> + 'a {
        (0..self.virtual_nodes).map(move |index| stable_hash(&format!("{shard_id}:{index}")))
    }

    /// Places the shard's virtual nodes on the ring.
    pub fn add_shard(&self, shard_id: &ShardId) {
        let positions: Vec<u64> = self.node_positions(shard_id).collect();
        let mut ring = self.ring.write();
        for position in positions {
            ring.entry(position).or_insert_with(|| shard_id.clone());
        }
    }

    /// Takes the shard's virtual nodes off the ring.
    pub fn remove_shard(&self, shard_id: &ShardId) {
        let positions: Vec<u64> = self.node_positions(shard_id).collect();
        let mut ring = self.ring.write();
        for position in positions {
            if ring.get(&position) == Some(shard_id) {
                ring.remove(&position);
            }
        }
    }

    /// Virtual nodes currently on the ring.
    pub fn ring_size(&self) -> usize {
        self.ring.read().len()
    }

    /// Shard owning `key`, computed synchronously.
    pub fn place(&self, key: &str) -> ShardResult<ShardId> {
        let hash = stable_hash(key);
        let ring = self.ring.read();
        ring.range(hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, shard)| shard.clone())
            .ok_or(ShardError::NoShards)
    }
}

#[async_trait]
impl ShardingStrategy for ConsistentHashStrategy {
    fn name(&self) -> &StrategyName {
        &self.name
    }

    async fn shard_id(&self, key: &str) -> ShardResult<ShardId> {
        self.place(key)
    }

    fn on_shard_added(&self, shard_id: &ShardId) {
        self.add_shard(shard_id);
    }

    fn on_shard_removed(&self, shard_id: &ShardId) {
        self.remove_shard(shard_id);
    }
}

/// One row of a [`RangeStrategy`] table: `min <= key < max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRange {
    /// Inclusive lower bound
    pub min: f64,
    /// Exclusive upper bound
    pub max: f64,
    /// Owner of the range
    pub shard_id: ShardId,
}

impl ShardRange {
    /// A `[min, max)` range owned by `shard_id`.
    pub const fn new(min: f64, max: f64, shard_id: ShardId) -> Self {
        Self { min, max, shard_id }
    }

    fn contains(&self, value: f64) -> bool {
        value >= self.min && value < self.max
    }
}

type KeyExtractor = dyn Fn(&Value) -> Option<f64> + Send + Sync;

/// Places numeric keys by range.
pub struct RangeStrategy {
    name: StrategyName,
    ranges: Vec<ShardRange>,
    key_extractor: Box<KeyExtractor>,
}

impl std::fmt::Debug for RangeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeStrategy")
            .field("name", &self.name)
            .field("ranges", &self.ranges)
            .finish_non_exhaustive()
    }
}

impl RangeStrategy {
    /// A range table; `key_extractor` pulls the ordering key out of a data
    /// item.
    pub fn new<F>(ranges: Vec<ShardRange>, key_extractor: F) -> Self
    where
        F: Fn(&Value) -> Option<f64> + Send + Sync + 'static,
    {
        Self {
            name: range_name(),
            ranges,
            key_extractor: Box::new(key_extractor),
        }
    }

    /// Registers the strategy under another name.
    #[must_use]
    pub fn named(mut self, name: StrategyName) -> Self {
        self.name = name;
        self
    }
}

#[async_trait]
impl ShardingStrategy for RangeStrategy {
    fn name(&self) -> &StrategyName {
        &self.name
    }

    fn shard_key(&self, data: &Value) -> ShardResult<String> {
        (self.key_extractor)(data)
            .map(|value| value.to_string())
            .ok_or_else(|| ShardError::InvalidKey(format!("no range key in {data}")))
    }

    async fn shard_id(&self, key: &str) -> ShardResult<ShardId> {
        let value: f64 = key
            .trim()
            .parse()
            .map_err(|_| ShardError::InvalidKey(format!("'{key}' is not a number")))?;
        self.ranges
            .iter()
            .find(|range| range.contains(value))
            .map(|range| range.shard_id.clone())
            .ok_or_else(|| ShardError::NoRangeForKey {
                key: key.to_string(),
            })
    }
}

/// External key to shard lookup consulted by a [`DirectoryStrategy`].
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// Shard owning `key`.
    async fn lookup(&self, key: &str) -> ShardResult<ShardId>;
}

/// Places keys through an explicit directory.
///
/// The local map is consulted first; misses go to the lookup service and
/// the answer is cached.
pub struct DirectoryStrategy {
    name: StrategyName,
    directory: RwLock<HashMap<String, ShardId>>,
    lookup: Option<Arc<dyn DirectoryLookup>>,
}

impl std::fmt::Debug for DirectoryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryStrategy")
            .field("name", &self.name)
            .field("entries", &self.directory.read().len())
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

impl Default for DirectoryStrategy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl DirectoryStrategy {
    /// A directory backed by an optional lookup service.
    pub fn new(lookup: Option<Arc<dyn DirectoryLookup>>) -> Self {
        Self {
            name: directory_name(),
            directory: RwLock::new(HashMap::new()),
            lookup,
        }
    }

    /// Pins `key` to `shard_id`.
    pub fn assign(&self, key: impl Into<String>, shard_id: ShardId) {
        self.directory.write().insert(key.into(), shard_id);
    }

    /// Forgets the local entry for `key`.
    pub fn unassign(&self, key: &str) -> Option<ShardId> {
        self.directory.write().remove(key)
    }

    /// Drops the cached placement of `data` and resolves it again through
    /// the lookup service.
    pub async fn redistribute(&self, data: &Value) -> ShardResult<ShardId> {
        let key = self.shard_key(data)?;
        self.unassign(&key);
        self.shard_id(&key).await
    }
}

#[async_trait]
impl ShardingStrategy for DirectoryStrategy {
    fn name(&self) -> &StrategyName {
        &self.name
    }

    async fn shard_id(&self, key: &str) -> ShardResult<ShardId> {
        let cached = self.directory.read().get(key).cloned();
        if let Some(shard) = cached {
            return Ok(shard);
        }
        let Some(lookup) = &self.lookup else {
            return Err(ShardError::Lookup {
                key: key.to_string(),
                message: "key not in directory and no lookup service configured".into(),
            });
        };
        let shard = lookup.lookup(key).await?;
        debug!(key, shard_id = %shard, "directory entry cached");
        self.assign(key, shard.clone());
        Ok(shard)
    }

    fn on_shard_removed(&self, shard_id: &ShardId) {
        self.directory.write().retain(|_, shard| shard != shard_id);
    }
}
