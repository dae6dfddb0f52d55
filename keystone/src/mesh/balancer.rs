use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;

use super::{LoadBalancingStrategy, ServiceInstance};
use crate::errors::{MeshError, MeshResult};
use crate::hash::bucket;
use crate::types::{InstanceId, ServiceId};

/// Picks one instance out of a service's healthy set.
///
/// Round-robin positions and weighted round-robin credit are kept per
/// service. Weighted round robin is the smooth variant: every pick adds each
/// instance's weight to its credit, takes the instance with the most credit
/// and charges it the total weight.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    positions: Mutex<HashMap<ServiceId, usize>>,
    credit: Mutex<HashMap<ServiceId, HashMap<InstanceId, i64>>>,
}

impl LoadBalancer {
    /// A balancer with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects an instance of `service_id` from `instances`.
    ///
    /// `routing_key` feeds [`LoadBalancingStrategy::KeyHash`]; without one,
    /// key hashing falls back to round robin.
    pub fn select(
        &self,
        service_id: &ServiceId,
        strategy: LoadBalancingStrategy,
        instances: &[ServiceInstance],
        routing_key: Option<&str>,
    ) -> MeshResult<ServiceInstance> {
        if instances.is_empty() {
            return Err(MeshError::NoHealthyInstances(service_id.clone()));
        }
        let index = match (strategy, routing_key) {
            (LoadBalancingStrategy::RoundRobin, _) | (LoadBalancingStrategy::KeyHash, None) => {
                self.next_position(service_id, instances.len())
            }
            (LoadBalancingStrategy::WeightedRoundRobin, _) => self.weighted(service_id, instances),
            (LoadBalancingStrategy::LeastConnections, _) => least_connections(instances),
            (LoadBalancingStrategy::Random, _) => rand::rng().random_range(0..instances.len()),
            (LoadBalancingStrategy::KeyHash, Some(key)) => {
                bucket(key, instances.len()).unwrap_or_default()
            }
        };
        instances
            .get(index)
            .cloned()
            .ok_or_else(|| MeshError::NoHealthyInstances(service_id.clone()))
    }

    fn next_position(&self, service_id: &ServiceId, len: usize) -> usize {
        let mut positions = self.positions.lock();
        let position = positions.entry(service_id.clone()).or_default();
        let index = *position % len;
        *position = position.wrapping_add(1);
        index
    }

    fn weighted(&self, service_id: &ServiceId, instances: &[ServiceInstance]) -> usize {
        let mut credit = self.credit.lock();
        let credit = credit.entry(service_id.clone()).or_default();
        credit.retain(|id, _| instances.iter().any(|instance| &instance.id == id));

        let total: i64 = instances.iter().map(|i| i64::from(i.weight)).sum();
        let mut best = 0;
        let mut best_credit = i64::MIN;
        for (index, instance) in instances.iter().enumerate() {
            let current = credit.entry(instance.id.clone()).or_default();
            *current += i64::from(instance.weight);
            if *current > best_credit {
                best = index;
                best_credit = *current;
            }
        }
        if let Some(chosen) = credit.get_mut(&instances[best].id) {
            *chosen -= total;
        }
        best
    }
}

fn least_connections(instances: &[ServiceInstance]) -> usize {
    instances
        .iter()
        .enumerate()
        .min_by_key(|(_, instance)| instance.active_connections)
        .map_or(0, |(index, _)| index)
}
