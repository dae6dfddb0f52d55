use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use super::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, HealthStatus,
    LoadBalancer, RequestRecord, ServiceDefinition, ServiceHealth, ServiceRegistry,
    ServiceRequest, ServiceResponse, ServiceTransport, SystemHealth,
};
use crate::config::{MeshConfig, TimeoutMs};
use crate::errors::{MeshError, MeshResult};
use crate::metrics::{Counter, MeshMetricsSummary, Timer};
use crate::retry::RetryPolicy;
use crate::types::{InstanceId, ServiceId, Timestamp};

/// Sends requests to healthy service instances.
///
/// Each attempt resolves the healthy set, lets the service's load-balancing
/// strategy pick an instance, and runs the transport call inside the
/// service's circuit breaker while the instance's connection count is
/// raised. Responses with a 5xx status are failures. A service's retry
/// policy is applied to timeouts, transport errors and 5xx responses only.
/// Every attempt leaves a [`RequestRecord`], kept in a bounded window.
pub struct MeshClient {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn ServiceTransport>,
    balancer: LoadBalancer,
    breakers: RwLock<HashMap<ServiceId, Arc<CircuitBreaker>>>,
    default_breaker: CircuitBreakerConfig,
    default_timeout: TimeoutMs,
    records: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
    total: Counter,
    successful: Counter,
    failed: Counter,
    response_time: Timer,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("default_timeout", &self.default_timeout)
            .field("default_breaker", &self.default_breaker)
            .field("total_requests", &self.total.get())
            .finish_non_exhaustive()
    }
}

impl MeshClient {
    /// A client over `registry` sending through `transport`.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn ServiceTransport>,
        config: &MeshConfig,
    ) -> Self {
        let capacity = config.metrics_capacity.into_inner();
        Self {
            registry,
            transport,
            balancer: LoadBalancer::new(),
            breakers: RwLock::new(HashMap::new()),
            default_breaker: config.circuit_breaker,
            default_timeout: config.default_request_timeout,
            records: Mutex::new(VecDeque::new()),
            capacity,
            total: Counter::new(),
            successful: Counter::new(),
            failed: Counter::new(),
            response_time: Timer::with_capacity(capacity),
        }
    }

    /// The registry requests are resolved against.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn breaker(&self, definition: &ServiceDefinition) -> Arc<CircuitBreaker> {
        let existing = self.breakers.read().get(&definition.id).cloned();
        if let Some(breaker) = existing {
            return breaker;
        }
        let config = definition.circuit_breaker.unwrap_or(self.default_breaker);
        Arc::clone(
            self.breakers
                .write()
                .entry(definition.id.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(definition.id.clone(), config))),
        )
    }

    /// Sends `request` and returns the response.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %request.id,
            service_id = %request.service_id,
            method = %request.method,
            path = %request.path
        )
    )]
    pub async fn request(&self, request: &ServiceRequest) -> MeshResult<ServiceResponse> {
        let Some(definition) = self.registry.get_service(&request.service_id) else {
            let error = MeshError::ServiceNotFound(request.service_id.clone());
            self.record(request, None, Err(&error), Duration::ZERO);
            return Err(error);
        };
        let breaker = self.breaker(&definition);
        let policy = definition
            .retry_policy
            .unwrap_or_else(RetryPolicy::no_retry);

        let (result, attempts) = policy
            .run(
                |_| self.attempt(&definition, &breaker, request),
                MeshError::is_retryable,
            )
            .await;
        if let Err(error) = &result {
            warn!(%error, attempts, "service request failed");
        } else if attempts > 1 {
            debug!(attempts, "service request succeeded after retries");
        }
        result
    }

    async fn attempt(
        &self,
        definition: &ServiceDefinition,
        breaker: &CircuitBreaker,
        request: &ServiceRequest,
    ) -> MeshResult<ServiceResponse> {
        let started = Instant::now();
        let mut chosen = None;
        let result = self.dispatch(definition, breaker, request, &mut chosen).await;
        self.record(request, chosen, result.as_ref(), started.elapsed());
        result
    }

    async fn dispatch(
        &self,
        definition: &ServiceDefinition,
        breaker: &CircuitBreaker,
        request: &ServiceRequest,
        chosen: &mut Option<InstanceId>,
    ) -> MeshResult<ServiceResponse> {
        let healthy = self.registry.healthy_instances(&definition.id)?;
        let instance = self.balancer.select(
            &definition.id,
            definition.load_balancing,
            &healthy,
            request.routing_key.as_deref(),
        )?;
        *chosen = Some(instance.id.clone());
        let timeout = request.timeout.unwrap_or(self.default_timeout).as_duration();

        breaker
            .call(|| async {
                let _connection = self.registry.track_connection(&definition.id, &instance.id);
                let started = Instant::now();
                let response = tokio::time::timeout(timeout, self.transport.send(&instance, request))
                    .await
                    .map_err(|_| MeshError::Timeout {
                        service_id: definition.id.clone(),
                        timeout,
                    })??;
                if response.status >= 500 {
                    return Err(MeshError::ServerError {
                        service_id: definition.id.clone(),
                        status: response.status,
                    });
                }
                Ok(ServiceResponse {
                    request_id: request.id,
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    duration: started.elapsed(),
                    instance_id: instance.id.clone(),
                })
            })
            .await
    }

    fn record(
        &self,
        request: &ServiceRequest,
        instance_id: Option<InstanceId>,
        result: Result<&ServiceResponse, &MeshError>,
        duration: Duration,
    ) {
        let status = match result {
            Ok(response) => Some(response.status),
            Err(MeshError::ServerError { status, .. }) => Some(*status),
            Err(_) => None,
        };
        let record = RequestRecord {
            request_id: request.id,
            service_id: request.service_id.clone(),
            instance_id,
            method: request.method.clone(),
            path: request.path.clone(),
            status,
            duration,
            timestamp: Timestamp::now(),
            error: result.err().map(ToString::to_string),
        };

        self.total.increment();
        if record.succeeded() {
            self.successful.increment();
        } else {
            self.failed.increment();
        }
        self.response_time.record(duration);

        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Retained request records, oldest first, optionally for one service
    /// and limited to the most recent `limit`.
    pub fn get_metrics(
        &self,
        service_id: Option<&ServiceId>,
        limit: Option<usize>,
    ) -> Vec<RequestRecord> {
        let records = self.records.lock();
        let matching: Vec<&RequestRecord> = records
            .iter()
            .filter(|record| service_id.map_or(true, |id| &record.service_id == id))
            .collect();
        let skip = limit.map_or(0, |limit| matching.len().saturating_sub(limit));
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Totals since the client was created.
    pub fn summary(&self) -> MeshMetricsSummary {
        let services = self.registry.services();
        let healthy_services = services
            .iter()
            .filter(|service| {
                self.registry
                    .healthy_instances(&service.id)
                    .is_ok_and(|instances| !instances.is_empty())
            })
            .count();
        MeshMetricsSummary {
            total_requests: self.total.get(),
            successful_requests: self.successful.get(),
            failed_requests: self.failed.get(),
            average_response_time_ms: self
                .response_time
                .mean()
                .map_or(0.0, |mean| mean.as_secs_f64() * 1000.0),
            healthy_services,
            total_services: services.len(),
            circuit_breaker_trips: self.breakers.read().values().map(|b| b.trips()).sum(),
        }
    }

    /// State of a service's breaker; closed if it was never called.
    pub fn circuit_state(&self, service_id: &ServiceId) -> CircuitState {
        self.breakers
            .read()
            .get(service_id)
            .map_or(CircuitState::Closed, |breaker| breaker.state())
    }

    /// Statistics of every breaker created so far.
    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> =
            self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        stats
    }

    /// Health of one service from its instances, breaker and recent
    /// requests.
    pub fn get_service_health(&self, service_id: &ServiceId) -> MeshResult<ServiceHealth> {
        let instances = self.registry.instances(service_id)?;
        let healthy_instances = instances.iter().filter(|i| i.healthy).count();
        let circuit_state = self.circuit_state(service_id);

        let records = self.get_metrics(Some(service_id), None);
        let (average_response_time_ms, error_rate) = if records.is_empty() {
            (0.0, 0.0)
        } else {
            let count = records.len() as f64;
            let total_ms: f64 = records
                .iter()
                .map(|record| record.duration.as_secs_f64() * 1000.0)
                .sum();
            let failures = records.iter().filter(|record| !record.succeeded()).count() as f64;
            (total_ms / count, failures / count)
        };

        let status = if healthy_instances == 0 {
            HealthStatus::Unhealthy
        } else if healthy_instances < instances.len() || circuit_state != CircuitState::Closed {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(ServiceHealth {
            service_id: service_id.clone(),
            status,
            healthy_instances,
            total_instances: instances.len(),
            circuit_state,
            average_response_time_ms,
            error_rate,
        })
    }

    /// Health of every registered service.
    pub fn get_system_health(&self) -> SystemHealth {
        let services: std::collections::BTreeMap<ServiceId, ServiceHealth> = self
            .registry
            .services()
            .into_iter()
            .filter_map(|service| {
                self.get_service_health(&service.id)
                    .ok()
                    .map(|health| (service.id, health))
            })
            .collect();
        let status = services
            .values()
            .map(|health| health.status)
            .max_by_key(|status| severity(*status))
            .unwrap_or(HealthStatus::Healthy);
        SystemHealth {
            status,
            services,
            timestamp: Timestamp::now(),
        }
    }
}

const fn severity(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffMultiplier, DelayMs, FailureThreshold, MaxAttempts};
    use crate::mesh::{HealthProbe, ServiceInstance, TransportResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Status(u16),
        Refuse,
        Hang,
    }

    #[derive(Default)]
    struct FakeTransport {
        behaviour: Mutex<HashMap<u16, Behaviour>>,
        calls: AtomicUsize,
        peak_connections: AtomicUsize,
        registry: Mutex<Option<Arc<ServiceRegistry>>>,
    }

    impl FakeTransport {
        fn set(&self, port: u16, behaviour: Behaviour) {
            self.behaviour.lock().insert(port, behaviour);
        }
    }

    #[async_trait]
    impl ServiceTransport for FakeTransport {
        async fn send(
            &self,
            instance: &ServiceInstance,
            request: &ServiceRequest,
        ) -> MeshResult<TransportResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let registry = self.registry.lock().clone();
            if let Some(registry) = registry {
                let open = registry
                    .instances(&instance.service_id)
                    .unwrap()
                    .iter()
                    .map(|i| i.active_connections)
                    .sum();
                self.peak_connections.fetch_max(open, Ordering::SeqCst);
            }
            let behaviour = self
                .behaviour
                .lock()
                .get(&instance.port)
                .copied()
                .unwrap_or(Behaviour::Status(200));
            match behaviour {
                Behaviour::Status(status) => Ok(TransportResponse {
                    status,
                    headers: std::collections::BTreeMap::new(),
                    body: json!({ "port": instance.port, "path": request.path }),
                }),
                Behaviour::Refuse => Err(MeshError::Transport {
                    service_id: instance.service_id.clone(),
                    message: "connection refused".into(),
                }),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _instance: &ServiceInstance, _endpoint: &str) -> MeshResult<()> {
            Ok(())
        }
    }

    fn service() -> ServiceId {
        ServiceId::try_new("orders").unwrap()
    }

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            MaxAttempts::try_new(attempts).unwrap(),
            DelayMs::new(0),
            BackoffMultiplier::default(),
            DelayMs::new(0),
        )
    }

    fn setup(definition: ServiceDefinition, config: &MeshConfig) -> (MeshClient, Arc<FakeTransport>) {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(AlwaysHealthy),
            config.health_check_timeout,
        ));
        registry.register_service(definition).unwrap();
        let transport = Arc::new(FakeTransport::default());
        *transport.registry.lock() = Some(Arc::clone(&registry));
        let client = MeshClient::new(registry, Arc::clone(&transport) as Arc<dyn ServiceTransport>, config);
        (client, transport)
    }

    fn orders() -> ServiceDefinition {
        ServiceDefinition::new(service(), "Orders", "localhost", 8080)
    }

    fn get(path: &str) -> ServiceRequest {
        ServiceRequest::new(service(), "GET", path)
    }

    #[tokio::test]
    async fn successful_request_is_answered_and_recorded() {
        let (client, transport) = setup(orders(), &MeshConfig::default());

        let request = get("/orders/1");
        let request_id = request.id;
        let response = client.request(&request).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.request_id, request_id);
        assert_eq!(response.body["path"], "/orders/1");
        assert_eq!(transport.peak_connections.load(Ordering::SeqCst), 1);
        assert_eq!(
            client.registry().instances(&service()).unwrap()[0].active_connections,
            0
        );

        let records = client.get_metrics(None, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Some(200));
        assert!(records[0].succeeded());
        assert_eq!(client.summary().successful_requests, 1);
    }

    #[tokio::test]
    async fn server_errors_fail_the_request() {
        let (client, transport) = setup(orders(), &MeshConfig::default());
        transport.set(8080, Behaviour::Status(503));

        let error = client.request(&get("/")).await.unwrap_err();

        assert!(matches!(error, MeshError::ServerError { status: 503, .. }));
        let records = client.get_metrics(Some(&service()), None);
        assert_eq!(records[0].status, Some(503));
        assert!(records[0].error.is_some());
        assert_eq!(client.summary().failed_requests, 1);
    }

    #[tokio::test]
    async fn client_errors_are_responses() {
        let (client, transport) = setup(orders(), &MeshConfig::default());
        transport.set(8080, Behaviour::Status(404));

        let response = client.request(&get("/missing")).await.unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(client.circuit_state(&service()), CircuitState::Closed);
        assert_eq!(client.summary().failed_requests, 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast() {
        let definition = orders().with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: FailureThreshold::try_new(2).unwrap(),
            ..CircuitBreakerConfig::default()
        });
        let (client, transport) = setup(definition, &MeshConfig::default());
        transport.set(8080, Behaviour::Refuse);

        client.request(&get("/")).await.unwrap_err();
        client.request(&get("/")).await.unwrap_err();
        assert_eq!(client.circuit_state(&service()), CircuitState::Open);

        let error = client.request(&get("/")).await.unwrap_err();
        assert!(matches!(error, MeshError::CircuitOpen(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.summary().circuit_breaker_trips, 1);
        assert_eq!(client.get_metrics(None, None).len(), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_per_service_policy() {
        let (client, transport) =
            setup(orders().with_retry_policy(quick_retry(3)), &MeshConfig::default());
        transport.set(8080, Behaviour::Refuse);

        client.request(&get("/")).await.unwrap_err();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.summary().total_requests, 3);
    }

    #[tokio::test]
    async fn retries_move_to_another_instance() {
        let (client, transport) =
            setup(orders().with_retry_policy(quick_retry(2)), &MeshConfig::default());
        client
            .registry()
            .add_instance(&service(), "localhost", 8081, 1)
            .unwrap();
        transport.set(8080, Behaviour::Refuse);

        let response = client.request(&get("/")).await.unwrap();

        assert_eq!(response.body["port"], 8081);
    }

    #[tokio::test]
    async fn no_healthy_instance_is_not_retried() {
        let (client, transport) =
            setup(orders().with_retry_policy(quick_retry(3)), &MeshConfig::default());
        let instance = client.registry().instances(&service()).unwrap()[0].id.clone();
        client
            .registry()
            .set_instance_health(&service(), &instance, false)
            .unwrap();

        let error = client.request(&get("/")).await.unwrap_err();

        assert!(matches!(error, MeshError::NoHealthyInstances(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.summary().total_requests, 1);
    }

    #[tokio::test]
    async fn slow_instances_time_out() {
        let (client, transport) = setup(orders(), &MeshConfig::default());
        transport.set(8080, Behaviour::Hang);
        let mut request = get("/");
        request.timeout = Some(TimeoutMs::from_millis(20));

        let error = client.request(&request).await.unwrap_err();

        assert!(matches!(error, MeshError::Timeout { .. }));
        assert_eq!(
            client.registry().instances(&service()).unwrap()[0].active_connections,
            0
        );
    }

    #[tokio::test]
    async fn unknown_service_is_recorded() {
        let (client, _) = setup(orders(), &MeshConfig::default());
        let request = ServiceRequest::new(ServiceId::try_new("nope").unwrap(), "GET", "/");

        let error = client.request(&request).await.unwrap_err();

        assert!(matches!(error, MeshError::ServiceNotFound(_)));
        assert_eq!(client.get_metrics(None, None)[0].instance_id, None);
    }

    #[tokio::test]
    async fn records_are_bounded_and_limited() {
        let config = MeshConfig {
            metrics_capacity: crate::config::MetricsCapacity::try_new(3).unwrap(),
            ..MeshConfig::default()
        };
        let (client, _) = setup(orders(), &config);
        for index in 0..5 {
            client.request(&get(&format!("/{index}"))).await.unwrap();
        }

        let records = client.get_metrics(None, None);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].path, "/2");
        let last = client.get_metrics(Some(&service()), Some(1));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].path, "/4");
        assert_eq!(client.summary().total_requests, 5);
    }

    #[tokio::test]
    async fn health_reflects_instances_and_circuit() {
        let (client, _) = setup(orders(), &MeshConfig::default());
        let spare = client
            .registry()
            .add_instance(&service(), "localhost", 8081, 1)
            .unwrap();
        assert_eq!(client.get_system_health().status, HealthStatus::Healthy);

        client
            .registry()
            .set_instance_health(&service(), &spare.id, false)
            .unwrap();
        let health = client.get_service_health(&service()).unwrap();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.healthy_instances, 1);
        assert_eq!(health.total_instances, 2);

        let summary = client.summary();
        assert_eq!(summary.healthy_services, 1);
        assert_eq!(summary.total_services, 1);
    }
}
