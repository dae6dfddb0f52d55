//! Configuration for the coordination layer.
//!
//! Bounded scalars are `nutype` types, so an out-of-range value cannot be
//! constructed, neither in code nor when a configuration document is parsed.
//! Durations are expressed in milliseconds.

use std::collections::HashSet;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::mesh::{CircuitBreakerConfig, ServiceDefinition};
use crate::retry::RetryPolicy;
use crate::sharding::{strategy, ShardConfig};
use crate::types::{ShardId, StrategyName};

/// Total attempts for a retried operation, including the first.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxAttempts(u32);

impl MaxAttempts {
    /// A single attempt, no retries.
    pub fn one() -> Self {
        Self::try_new(1).unwrap_or_default()
    }
}

/// A delay in milliseconds. Zero means "no delay".
#[nutype(
    default = 0,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct DelayMs(u64);

impl DelayMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// A timeout or interval in milliseconds, between 1 ms and 24 hours.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400_000),
    default = 30_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct TimeoutMs(u64);

impl TimeoutMs {
    /// Builds a timeout from milliseconds, clamping into the valid range.
    pub fn from_millis(millis: u64) -> Self {
        Self::try_new(millis.clamp(1, 86_400_000)).unwrap_or_default()
    }

    /// Convert to Duration for use with `tokio::time::timeout`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Growth factor for exponential backoff.
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 10.0),
    default = 2.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Default, Serialize, Deserialize)
)]
pub struct BackoffMultiplier(f64);

/// Take a snapshot every this many events.
#[nutype(
    validate(greater_or_equal = 1),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct SnapshotFrequency(u64);

/// Virtual nodes per physical shard on the consistent-hash ring.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 150,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct VirtualNodes(usize);

/// Number of mesh request records to keep.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    default = 10_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MetricsCapacity(usize);

/// Consecutive failures that open a circuit.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000),
    default = 5,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct FailureThreshold(u32);

/// Consecutive half-open probe successes that close a circuit.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct HalfOpenSuccesses(u32);

/// A ratio between 0 and 1, such as an error rate.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.05,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Default, Serialize, Deserialize)
)]
pub struct Ratio(f64);

/// Event-sourcing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSourcingConfig {
    /// Snapshot cadence.
    pub snapshot_frequency: SnapshotFrequency,
    /// Whether the projection manager subscribes to published events.
    pub enable_projections: bool,
}

impl Default for EventSourcingConfig {
    fn default() -> Self {
        Self {
            snapshot_frequency: SnapshotFrequency::default(),
            enable_projections: true,
        }
    }
}

/// Saga orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Whether sagas may be started.
    pub enabled: bool,
    /// Per-attempt timeout for steps that do not set their own.
    pub default_step_timeout: TimeoutMs,
    /// Retry policy for steps that do not set their own.
    pub retry_policy: RetryPolicy,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_step_timeout: TimeoutMs::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Shard manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Whether the shard manager is built.
    pub enabled: bool,
    /// Strategy used when a call names none.
    pub default_strategy: StrategyName,
    /// Virtual nodes per shard for the consistent-hash strategy.
    pub virtual_nodes: VirtualNodes,
    /// The shards to connect on start.
    pub shards: Vec<ShardConfig>,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_strategy: strategy::hash_name(),
            virtual_nodes: VirtualNodes::default(),
            shards: local_shards(3),
        }
    }
}

/// Service mesh settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Whether the registry, client and gateway are built.
    pub enabled: bool,
    /// Time between health-check rounds.
    pub health_check_interval: TimeoutMs,
    /// Bound on a single health probe.
    pub health_check_timeout: TimeoutMs,
    /// Request timeout when a request sets none.
    pub default_request_timeout: TimeoutMs,
    /// Request records kept by the mesh client.
    pub metrics_capacity: MetricsCapacity,
    /// Breaker settings for services that do not set their own.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Services registered on start.
    pub services: Vec<ServiceDefinition>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval: TimeoutMs::from_millis(30_000),
            health_check_timeout: TimeoutMs::from_millis(5_000),
            default_request_timeout: TimeoutMs::from_millis(30_000),
            metrics_capacity: MetricsCapacity::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            services: Vec::new(),
        }
    }
}

/// Thresholds that raise a warning when crossed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Mesh error rate.
    pub error_rate: Ratio,
    /// Mean mesh response time.
    pub response_time: TimeoutMs,
    /// Circuit breaker trips.
    pub circuit_breaker_trips: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: Ratio::default(),
            response_time: TimeoutMs::from_millis(1_000),
            circuit_breaker_trips: 3,
        }
    }
}

/// Monitoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether the periodic alert check runs.
    pub enabled: bool,
    /// Time between alert checks.
    pub metrics_interval: TimeoutMs,
    /// Alert thresholds.
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval: TimeoutMs::from_millis(60_000),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// Configuration for the whole coordination layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Event sourcing and projections.
    pub event_sourcing: EventSourcingConfig,
    /// Saga orchestration.
    pub saga: SagaConfig,
    /// Sharding.
    pub sharding: ShardingConfig,
    /// Service mesh.
    pub mesh: MeshConfig,
    /// Monitoring and alerts.
    pub monitoring: MonitoringConfig,
}

impl CoordinationConfig {
    /// CQRS and monitoring only: no projections, sharding, mesh or sagas.
    pub fn minimal() -> Self {
        Self {
            event_sourcing: EventSourcingConfig {
                enable_projections: false,
                ..EventSourcingConfig::default()
            },
            saga: SagaConfig {
                enabled: false,
                ..SagaConfig::default()
            },
            sharding: ShardingConfig {
                enabled: false,
                shards: Vec::new(),
                ..ShardingConfig::default()
            },
            mesh: MeshConfig {
                enabled: false,
                ..MeshConfig::default()
            },
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Tighter timeouts, more retries, five shards on a consistent-hash ring.
    pub fn high_performance() -> Self {
        Self {
            event_sourcing: EventSourcingConfig::default(),
            saga: SagaConfig {
                enabled: true,
                default_step_timeout: TimeoutMs::from_millis(15_000),
                retry_policy: RetryPolicy::new(
                    MaxAttempts::try_new(5).unwrap_or_default(),
                    DelayMs::new(500),
                    BackoffMultiplier::try_new(1.5).unwrap_or_default(),
                    DelayMs::new(10_000),
                ),
            },
            sharding: ShardingConfig {
                enabled: true,
                default_strategy: strategy::consistent_hash_name(),
                virtual_nodes: VirtualNodes::default(),
                shards: local_shards(5),
            },
            mesh: MeshConfig {
                health_check_interval: TimeoutMs::from_millis(15_000),
                ..MeshConfig::default()
            },
            monitoring: MonitoringConfig {
                enabled: true,
                metrics_interval: TimeoutMs::from_millis(30_000),
                alert_thresholds: AlertThresholds {
                    error_rate: Ratio::try_new(0.01).unwrap_or_default(),
                    response_time: TimeoutMs::from_millis(500),
                    circuit_breaker_trips: 2,
                },
            },
        }
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// Missing sections and fields take their defaults.
    pub fn from_json_str(document: &str) -> Result<Self, ValidationError> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ValidationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the constraints that span several fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let retry = &self.saga.retry_policy;
        if retry.max_delay < retry.initial_delay {
            return Err(ValidationError::invalid(
                "saga.retry_policy.max_delay",
                "must not be smaller than initial_delay",
            ));
        }

        let mut shard_ids = HashSet::new();
        for shard in &self.sharding.shards {
            if !shard_ids.insert(&shard.id) {
                return Err(ValidationError::invalid(
                    "sharding.shards",
                    format!("duplicate shard id '{}'", shard.id),
                ));
            }
        }

        let mut service_ids = HashSet::new();
        for service in &self.mesh.services {
            if !service_ids.insert(&service.id) {
                return Err(ValidationError::invalid(
                    "mesh.services",
                    format!("duplicate service id '{}'", service.id),
                ));
            }
        }

        if self.mesh.health_check_timeout > self.mesh.health_check_interval {
            return Err(ValidationError::invalid(
                "mesh.health_check_timeout",
                "must not exceed health_check_interval",
            ));
        }

        Ok(())
    }
}

fn local_shards(count: u16) -> Vec<ShardConfig> {
    (0..count)
        .filter_map(|index| {
            ShardId::try_new(format!("shard-{index}"))
                .ok()
                .map(|id| ShardConfig::new(id, "localhost", 5432 + index, format!("keystone_{index}")))
        })
        .collect()
}
