//! Metric primitives and the per-subsystem counters built from them.
//!
//! [`Counter`] is lock-free; [`Timer`] keeps a bounded window of recent
//! samples. Subsystems own their metric structs and expose plain serializable
//! snapshots, which the facade folds into [`EnterpriseMetrics`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::saga::SagaStatusCounts;
use crate::sharding::ShardingMetrics;

const DEFAULT_TIMER_SAMPLES: usize = 1000;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Creates a counter at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Adds one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `amount`.
    pub fn increment_by(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Records durations, keeping only the most recent samples.
#[derive(Debug)]
pub struct Timer {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
    count: AtomicU64,
}

impl Timer {
    /// Creates a timer keeping the last 1000 samples.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TIMER_SAMPLES)
    }

    /// Creates a timer keeping the last `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_TIMER_SAMPLES))),
            capacity,
            count: AtomicU64::new(0),
        }
    }

    /// Records one sample.
    pub fn record(&self, duration: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(duration);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Times an async operation.
    pub async fn time_async<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let start = Instant::now();
        let result = f().await;
        self.record(start.elapsed());
        result
    }

    /// Total samples ever recorded, including evicted ones.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean of the retained samples.
    pub fn mean(&self) -> Option<Duration> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / u32::try_from(samples.len()).unwrap_or(u32::MAX))
    }

    /// The `percent`th percentile (nearest rank, clamped to 100) of the
    /// retained samples.
    pub fn percentile(&self, percent: u8) -> Option<Duration> {
        let mut samples: Vec<Duration> = self.samples.lock().iter().copied().collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort();
        let percent = usize::from(percent.min(100));
        let index = ((samples.len() - 1) * percent + 50) / 100;
        samples.get(index).copied()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Option<Duration>) -> f64 {
    duration.map_or(0.0, |d| d.as_secs_f64() * 1000.0)
}

/// Counters maintained by the CQRS engine.
#[derive(Debug, Default)]
pub struct CqrsMetrics {
    /// Commands dispatched
    pub commands: Counter,
    /// Commands that returned an error
    pub command_failures: Counter,
    /// Queries dispatched
    pub queries: Counter,
    /// Queries that returned an error
    pub query_failures: Counter,
    /// Event deliveries to subscribers
    pub events_published: Counter,
    /// Event deliveries that failed
    pub publish_failures: Counter,
    /// Command execution time
    pub command_time: Timer,
    /// Query execution time
    pub query_time: Timer,
}

impl CqrsMetrics {
    /// Plain copy of the current values.
    pub fn snapshot(&self) -> CqrsMetricsSnapshot {
        CqrsMetricsSnapshot {
            commands_executed: self.commands.get(),
            command_failures: self.command_failures.get(),
            queries_executed: self.queries.get(),
            query_failures: self.query_failures.get(),
            events_published: self.events_published.get(),
            publish_failures: self.publish_failures.get(),
            average_command_time_ms: millis(self.command_time.mean()),
            average_query_time_ms: millis(self.query_time.mean()),
        }
    }
}

/// Serializable view of [`CqrsMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CqrsMetricsSnapshot {
    /// Commands dispatched
    pub commands_executed: u64,
    /// Commands that failed
    pub command_failures: u64,
    /// Queries dispatched
    pub queries_executed: u64,
    /// Queries that failed
    pub query_failures: u64,
    /// Event deliveries to subscribers
    pub events_published: u64,
    /// Failed event deliveries
    pub publish_failures: u64,
    /// Mean command time in milliseconds
    pub average_command_time_ms: f64,
    /// Mean query time in milliseconds
    pub average_query_time_ms: f64,
}

/// Counters maintained by the event-sourcing engine, projections and audit.
#[derive(Debug, Default)]
pub struct EventSourcingMetrics {
    /// Events persisted
    pub events_stored: Counter,
    /// Aggregates hydrated
    pub aggregates_loaded: Counter,
    /// Snapshots written
    pub snapshots_created: Counter,
    /// Snapshot attempts that failed (never surfaced to the writer)
    pub snapshot_failures: Counter,
    /// Successful projection updates
    pub projections_updated: Counter,
    /// Projection handler failures
    pub projection_failures: Counter,
    /// Audit queries served
    pub audit_queries: Counter,
}

impl EventSourcingMetrics {
    /// Plain copy of the current values.
    pub fn snapshot(&self) -> EventSourcingMetricsSnapshot {
        EventSourcingMetricsSnapshot {
            events_stored: self.events_stored.get(),
            aggregates_loaded: self.aggregates_loaded.get(),
            snapshots_created: self.snapshots_created.get(),
            snapshot_failures: self.snapshot_failures.get(),
            projections_updated: self.projections_updated.get(),
            projection_failures: self.projection_failures.get(),
            audit_queries: self.audit_queries.get(),
        }
    }
}

/// Serializable view of [`EventSourcingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSourcingMetricsSnapshot {
    /// Events persisted
    pub events_stored: u64,
    /// Aggregates hydrated
    pub aggregates_loaded: u64,
    /// Snapshots written
    pub snapshots_created: u64,
    /// Snapshot attempts that failed
    pub snapshot_failures: u64,
    /// Successful projection updates
    pub projections_updated: u64,
    /// Projection handler failures
    pub projection_failures: u64,
    /// Audit queries served
    pub audit_queries: u64,
}

/// Totals across every mesh request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshMetricsSummary {
    /// Requests issued
    pub total_requests: u64,
    /// Requests that returned a response below 400
    pub successful_requests: u64,
    /// Requests that failed or returned 400 and above
    pub failed_requests: u64,
    /// Mean request duration in milliseconds
    pub average_response_time_ms: f64,
    /// Services with at least one healthy instance
    pub healthy_services: usize,
    /// Registered services
    pub total_services: usize,
    /// Circuit breaker trips since start
    pub circuit_breaker_trips: u64,
}

/// One view over every subsystem's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnterpriseMetrics {
    /// Dispatch counters
    pub cqrs: CqrsMetricsSnapshot,
    /// Persistence counters
    pub event_sourcing: EventSourcingMetricsSnapshot,
    /// Saga instances by status
    pub sagas: SagaStatusCounts,
    /// Shard manager metrics, when sharding is enabled
    pub sharding: Option<ShardingMetrics>,
    /// Mesh totals, when the mesh is enabled
    pub mesh: Option<MeshMetricsSummary>,
}
