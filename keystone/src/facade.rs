//! One object graph over every subsystem of the coordination layer.
//!
//! [`EnterpriseCoordinator`] is built from a [`CoordinationConfig`] plus the
//! adapters the core cannot provide itself: an event store, a saga
//! repository, and optionally a shard connection factory and a mesh
//! transport with its health probe. Nothing runs in the background until
//! [`start`](EnterpriseCoordinator::start) is called.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::audit::AuditTrail;
use crate::config::{AlertThresholds, CoordinationConfig, TimeoutMs};
use crate::cqrs::{CommandOutcome, CqrsEngine, EventHandler};
use crate::errors::{
    CoordinationResult, MeshError, MeshResult, ShardError, ShardResult, ValidationError,
};
use crate::event_sourcing::EventSourcingEngine;
use crate::event_store::EventStore;
use crate::mesh::{
    ApiGateway, HealthProbe, MeshClient, RouteRequest, ServiceRegistry, ServiceResponse,
    ServiceTransport,
};
use crate::message::{Command, Query};
use crate::metrics::{EnterpriseMetrics, MeshMetricsSummary};
use crate::projection::ProjectionManager;
use crate::saga::{
    ActionExecutor, DefaultActionExecutor, SagaOrchestrator, SagaRepository, SagaStatus,
    SagaStatusCounts,
};
use crate::sharding::{ShardConnectionFactory, ShardManager};
use crate::types::SagaId;

/// A monitored value that crossed its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    /// Share of failed mesh requests.
    ErrorRate {
        /// Observed ratio
        observed: f64,
        /// Configured ratio
        threshold: f64,
    },
    /// Mean mesh response time.
    ResponseTime {
        /// Observed mean in milliseconds
        observed_ms: f64,
        /// Configured bound in milliseconds
        threshold_ms: u64,
    },
    /// Circuit breaker trips since start.
    CircuitBreakerTrips {
        /// Observed trips
        observed: u64,
        /// Configured bound
        threshold: u64,
    },
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ErrorRate {
                observed,
                threshold,
            } => write!(f, "error rate {observed:.3} above {threshold:.3}"),
            Self::ResponseTime {
                observed_ms,
                threshold_ms,
            } => write!(f, "mean response time {observed_ms:.1}ms above {threshold_ms}ms"),
            Self::CircuitBreakerTrips {
                observed,
                threshold,
            } => write!(f, "{observed} circuit breaker trips, threshold {threshold}"),
        }
    }
}

/// Thresholds crossed by `summary`. An idle mesh raises nothing.
pub fn evaluate_alerts(summary: &MeshMetricsSummary, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if summary.total_requests > 0 {
        let observed = summary.failed_requests as f64 / summary.total_requests as f64;
        let threshold = thresholds.error_rate.into_inner();
        if observed > threshold {
            alerts.push(Alert::ErrorRate {
                observed,
                threshold,
            });
        }

        let threshold_ms = thresholds.response_time.into_inner();
        if summary.average_response_time_ms > threshold_ms as f64 {
            alerts.push(Alert::ResponseTime {
                observed_ms: summary.average_response_time_ms,
                threshold_ms,
            });
        }
    }
    if summary.circuit_breaker_trips >= thresholds.circuit_breaker_trips
        && thresholds.circuit_breaker_trips > 0
    {
        alerts.push(Alert::CircuitBreakerTrips {
            observed: summary.circuit_breaker_trips,
            threshold: thresholds.circuit_breaker_trips,
        });
    }
    alerts
}

struct MeshParts {
    registry: Arc<ServiceRegistry>,
    client: Arc<MeshClient>,
    gateway: Arc<ApiGateway>,
}

/// Assembles an [`EnterpriseCoordinator`].
#[must_use]
pub struct CoordinatorBuilder<S: ?Sized, R: ?Sized> {
    config: CoordinationConfig,
    event_store: Arc<S>,
    saga_repository: Arc<R>,
    shard_factory: Option<Arc<dyn ShardConnectionFactory>>,
    mesh: Option<(Arc<dyn ServiceTransport>, Arc<dyn HealthProbe>)>,
}

impl<S, R> CoordinatorBuilder<S, R>
where
    S: EventStore + ?Sized + 'static,
    R: SagaRepository + ?Sized + 'static,
{
    /// Connection factory for the configured shards. Required when sharding
    /// is enabled.
    pub fn with_shard_factory(mut self, factory: Arc<dyn ShardConnectionFactory>) -> Self {
        self.shard_factory = Some(factory);
        self
    }

    /// Transport and health probe for the mesh. Required when the mesh is
    /// enabled.
    pub fn with_mesh(
        mut self,
        transport: Arc<dyn ServiceTransport>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        self.mesh = Some((transport, probe));
        self
    }

    /// Validates the configuration, connects the shards and registers the
    /// configured services.
    #[instrument(skip(self))]
    pub async fn build(self) -> CoordinationResult<EnterpriseCoordinator<S, R>> {
        let Self {
            config,
            event_store,
            saga_repository,
            shard_factory,
            mesh,
        } = self;
        config.validate()?;

        let event_sourcing =
            EventSourcingEngine::new(event_store, config.event_sourcing.snapshot_frequency);
        let cqrs = Arc::new(CqrsEngine::new());

        let projections = Arc::new(ProjectionManager::new(event_sourcing.clone()));
        if config.event_sourcing.enable_projections {
            cqrs.event_bus()
                .subscribe_all(Arc::clone(&projections) as Arc<dyn EventHandler>);
        }
        let audit = AuditTrail::new(event_sourcing.clone());

        let shards = if config.sharding.enabled {
            let factory = shard_factory.ok_or_else(|| {
                ValidationError::invalid("sharding", "enabled without a shard connection factory")
            })?;
            Some(Arc::new(ShardManager::connect(&config.sharding, factory).await?))
        } else {
            None
        };

        let mesh = if config.mesh.enabled {
            let (transport, probe) = mesh.ok_or_else(|| {
                ValidationError::invalid("mesh", "enabled without a transport and health probe")
            })?;
            let registry = Arc::new(ServiceRegistry::new(probe, config.mesh.health_check_timeout));
            for definition in &config.mesh.services {
                registry.register_service(definition.clone())?;
            }
            let client = Arc::new(MeshClient::new(Arc::clone(&registry), transport, &config.mesh));
            let gateway = Arc::new(ApiGateway::new(Arc::clone(&client)));
            Some(MeshParts {
                registry,
                client,
                gateway,
            })
        } else {
            None
        };

        let mut executor = DefaultActionExecutor::new().with_engine(Arc::clone(&cqrs));
        if let Some(parts) = &mesh {
            executor = executor.with_gateway(Arc::clone(&parts.gateway));
        }
        let executor = Arc::new(executor);
        let sagas = SagaOrchestrator::new(
            saga_repository,
            Arc::clone(&executor) as Arc<dyn ActionExecutor>,
            config.saga.clone(),
        );

        info!(
            projections = config.event_sourcing.enable_projections,
            sharding = shards.is_some(),
            mesh = mesh.is_some(),
            sagas = config.saga.enabled,
            "coordinator assembled"
        );

        Ok(EnterpriseCoordinator {
            config,
            cqrs,
            event_sourcing,
            projections,
            audit,
            executor,
            sagas,
            shards,
            mesh,
            monitor: Mutex::new(None),
        })
    }
}

/// Entry point to the coordination layer.
pub struct EnterpriseCoordinator<S: ?Sized, R: ?Sized> {
    config: CoordinationConfig,
    cqrs: Arc<CqrsEngine>,
    event_sourcing: EventSourcingEngine<S>,
    projections: Arc<ProjectionManager<S>>,
    audit: AuditTrail<S>,
    executor: Arc<DefaultActionExecutor>,
    sagas: SagaOrchestrator<R>,
    shards: Option<Arc<ShardManager>>,
    mesh: Option<MeshParts>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ?Sized, R: ?Sized> std::fmt::Debug for EnterpriseCoordinator<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnterpriseCoordinator")
            .field("sharding", &self.shards.is_some())
            .field("mesh", &self.mesh.is_some())
            .field("monitoring", &self.monitor.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl<S, R> EnterpriseCoordinator<S, R>
where
    S: EventStore + ?Sized + 'static,
    R: SagaRepository + ?Sized + 'static,
{
    /// Starts assembling a coordinator over `event_store` and
    /// `saga_repository`.
    pub fn builder(
        config: CoordinationConfig,
        event_store: Arc<S>,
        saga_repository: Arc<R>,
    ) -> CoordinatorBuilder<S, R> {
        CoordinatorBuilder {
            config,
            event_store,
            saga_repository,
            shard_factory: None,
            mesh: None,
        }
    }

    /// The configuration the coordinator was built with.
    pub const fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Command, query and event dispatch.
    pub const fn cqrs(&self) -> &Arc<CqrsEngine> {
        &self.cqrs
    }

    /// Aggregate loading and commits.
    pub const fn event_sourcing(&self) -> &EventSourcingEngine<S> {
        &self.event_sourcing
    }

    /// Read models.
    pub const fn projections(&self) -> &Arc<ProjectionManager<S>> {
        &self.projections
    }

    /// Audit queries.
    pub const fn audit(&self) -> &AuditTrail<S> {
        &self.audit
    }

    /// Executor used by saga steps; register saga functions here.
    pub const fn executor(&self) -> &Arc<DefaultActionExecutor> {
        &self.executor
    }

    /// Saga orchestration.
    pub const fn sagas(&self) -> &SagaOrchestrator<R> {
        &self.sagas
    }

    /// The shard manager, when sharding is enabled.
    pub fn shards(&self) -> ShardResult<&Arc<ShardManager>> {
        self.shards.as_ref().ok_or(ShardError::Disabled)
    }

    /// The mesh gateway, when the mesh is enabled.
    pub fn gateway(&self) -> MeshResult<&Arc<ApiGateway>> {
        self.mesh
            .as_ref()
            .map(|parts| &parts.gateway)
            .ok_or(MeshError::Disabled)
    }

    /// The service registry, when the mesh is enabled.
    pub fn registry(&self) -> MeshResult<&Arc<ServiceRegistry>> {
        self.mesh
            .as_ref()
            .map(|parts| &parts.registry)
            .ok_or(MeshError::Disabled)
    }

    /// Dispatches a command.
    pub async fn execute_command(&self, command: Command) -> CoordinationResult<CommandOutcome> {
        Ok(self.cqrs.execute_command(command).await?)
    }

    /// Runs a query.
    pub async fn execute_query(&self, query: Query) -> CoordinationResult<Value> {
        Ok(self.cqrs.execute_query(query).await?)
    }

    /// Sends a request through the mesh gateway.
    pub async fn route_request(&self, route: RouteRequest) -> CoordinationResult<ServiceResponse> {
        Ok(self.gateway()?.route_request(route).await?)
    }

    /// Resumes persisted sagas and starts the health-check and monitoring
    /// tasks.
    ///
    /// Saga definitions must be registered before starting so that
    /// interrupted instances can be resumed. Calling `start` on a running
    /// coordinator only resumes sagas again.
    #[instrument(skip(self))]
    pub async fn start(&self) -> CoordinationResult<Vec<SagaId>> {
        let resumed = if self.config.saga.enabled {
            self.sagas.recover().await?
        } else {
            Vec::new()
        };

        if let Some(parts) = &self.mesh {
            parts
                .registry
                .start_health_checks(self.config.mesh.health_check_interval);
            if self.config.monitoring.enabled {
                self.start_monitoring(&parts.client);
            }
        } else if self.config.monitoring.enabled {
            debug!("monitoring has no mesh to watch");
        }

        info!(resumed = resumed.len(), "coordinator started");
        Ok(resumed)
    }

    fn start_monitoring(&self, client: &Arc<MeshClient>) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let client: Weak<MeshClient> = Arc::downgrade(client);
        let thresholds = self.config.monitoring.alert_thresholds;
        let period = self.config.monitoring.metrics_interval;
        *monitor = Some(tokio::spawn(monitor_loop(client, thresholds, period)));
    }

    /// Whether the monitoring task is running.
    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops background tasks and closes every shard connection.
    ///
    /// Sagas still executing stay persisted at their last checkpoint and
    /// are resumed by the next `start`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        self.sagas.shutdown();
        if let Some(parts) = &self.mesh {
            parts.registry.stop_health_checks();
        }
        if let Some(shards) = &self.shards {
            shards.close_all().await;
        }
        info!("coordinator stopped");
    }

    /// Current metrics of every subsystem.
    pub async fn metrics(&self) -> CoordinationResult<EnterpriseMetrics> {
        let mut sagas = SagaStatusCounts::default();
        for status in SagaStatus::ALL {
            let count = self.sagas.repository().find_by_status(status).await?.len();
            sagas.set(status, count);
        }
        Ok(EnterpriseMetrics {
            cqrs: self.cqrs.metrics().snapshot(),
            event_sourcing: self.event_sourcing.metrics().snapshot(),
            sagas,
            sharding: self.shards.as_deref().map(ShardManager::metrics),
            mesh: self.mesh.as_ref().map(|parts| parts.client.summary()),
        })
    }

    /// Alerts raised by the current mesh totals.
    pub fn check_alerts(&self) -> Vec<Alert> {
        self.mesh.as_ref().map_or_else(Vec::new, |parts| {
            evaluate_alerts(
                &parts.client.summary(),
                &self.config.monitoring.alert_thresholds,
            )
        })
    }
}

impl<S: ?Sized, R: ?Sized> Drop for EnterpriseCoordinator<S, R> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

async fn monitor_loop(client: Weak<MeshClient>, thresholds: AlertThresholds, period: TimeoutMs) {
    let mut ticker = interval(period.as_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(client) = client.upgrade() else {
            break;
        };
        for alert in evaluate_alerts(&client.summary(), &thresholds) {
            warn!(%alert, "alert threshold crossed");
        }
    }
}
