use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::{HealthProbe, ServiceDefinition, ServiceInstance};
use crate::config::TimeoutMs;
use crate::errors::{MeshError, MeshResult};
use crate::types::{InstanceId, ServiceId, Timestamp};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notifications published by the [`ServiceRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A service was registered.
    ServiceRegistered(ServiceId),
    /// A service and its instances were removed.
    ServiceUnregistered(ServiceId),
    /// An instance was added to a service.
    InstanceAdded {
        /// The service
        service_id: ServiceId,
        /// The new instance
        instance_id: InstanceId,
    },
    /// An instance was removed from a service.
    InstanceRemoved {
        /// The service
        service_id: ServiceId,
        /// The removed instance
        instance_id: InstanceId,
    },
    /// An instance's health flag flipped.
    HealthChanged {
        /// The service
        service_id: ServiceId,
        /// The instance
        instance_id: InstanceId,
        /// The new flag
        healthy: bool,
    },
}

#[derive(Debug)]
struct ServiceEntry {
    definition: ServiceDefinition,
    instances: BTreeMap<InstanceId, ServiceInstance>,
    next_instance: u64,
}

impl ServiceEntry {
    fn new_instance(&mut self, host: String, port: u16, weight: u32) -> MeshResult<ServiceInstance> {
        let service_id = self.definition.id.clone();
        let id = InstanceId::try_new(format!("{service_id}-{}", self.next_instance))
            .map_err(|error| MeshError::InvalidDefinition(format!("instance id: {error}")))?;
        self.next_instance += 1;
        let instance = ServiceInstance {
            id,
            service_id,
            protocol: self.definition.protocol,
            host,
            port,
            weight: weight.max(1),
            healthy: true,
            active_connections: 0,
            last_health_check: None,
        };
        self.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }
}

struct ProbeTarget {
    instance: ServiceInstance,
    endpoint: Option<String>,
}

/// Service definitions, their instances and the instances' health.
///
/// Health checks probe every instance with a health endpoint concurrently,
/// each bounded by the health-check timeout; a probe that errors or times
/// out marks the instance unhealthy. Instances without a health endpoint
/// are always healthy. Flag transitions are published as
/// [`RegistryEvent::HealthChanged`].
pub struct ServiceRegistry {
    services: RwLock<BTreeMap<ServiceId, ServiceEntry>>,
    probe: Arc<dyn HealthProbe>,
    health_check_timeout: TimeoutMs,
    events: broadcast::Sender<RegistryEvent>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.read().keys().collect::<Vec<_>>())
            .field("health_check_timeout", &self.health_check_timeout)
            .field("health_checking", &self.is_health_checking())
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// An empty registry probing instances with `probe`.
    pub fn new(probe: Arc<dyn HealthProbe>, health_check_timeout: TimeoutMs) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            services: RwLock::new(BTreeMap::new()),
            probe,
            health_check_timeout,
            events,
            health_task: Mutex::new(None),
        }
    }

    /// Receives change notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    /// Registers a service and creates its initial instance at the
    /// definition's host and port.
    #[instrument(skip(self, definition), fields(service_id = %definition.id))]
    pub fn register_service(&self, definition: ServiceDefinition) -> MeshResult<ServiceInstance> {
        let service_id = definition.id.clone();
        let instance = {
            let mut services = self.services.write();
            if services.contains_key(&service_id) {
                return Err(MeshError::DuplicateService(service_id));
            }
            let (host, port) = (definition.host.clone(), definition.port);
            let mut entry = ServiceEntry {
                definition,
                instances: BTreeMap::new(),
                next_instance: 0,
            };
            let instance = entry.new_instance(host, port, 1)?;
            services.insert(service_id.clone(), entry);
            instance
        };
        info!(instance_id = %instance.id, "service registered");
        self.publish(RegistryEvent::ServiceRegistered(service_id.clone()));
        self.publish(RegistryEvent::InstanceAdded {
            service_id,
            instance_id: instance.id.clone(),
        });
        Ok(instance)
    }

    /// Removes a service and all of its instances.
    pub fn unregister_service(&self, service_id: &ServiceId) -> MeshResult<ServiceDefinition> {
        let entry = self
            .services
            .write()
            .remove(service_id)
            .ok_or_else(|| MeshError::ServiceNotFound(service_id.clone()))?;
        info!(%service_id, "service unregistered");
        self.publish(RegistryEvent::ServiceUnregistered(service_id.clone()));
        Ok(entry.definition)
    }

    /// Adds an instance to a registered service.
    pub fn add_instance(
        &self,
        service_id: &ServiceId,
        host: impl Into<String>,
        port: u16,
        weight: u32,
    ) -> MeshResult<ServiceInstance> {
        let instance = self
            .services
            .write()
            .get_mut(service_id)
            .ok_or_else(|| MeshError::ServiceNotFound(service_id.clone()))?
            .new_instance(host.into(), port, weight)?;
        debug!(%service_id, instance_id = %instance.id, "instance added");
        self.publish(RegistryEvent::InstanceAdded {
            service_id: service_id.clone(),
            instance_id: instance.id.clone(),
        });
        Ok(instance)
    }

    /// Removes an instance from a service.
    pub fn remove_instance(
        &self,
        service_id: &ServiceId,
        instance_id: &InstanceId,
    ) -> MeshResult<ServiceInstance> {
        let instance = self
            .services
            .write()
            .get_mut(service_id)
            .ok_or_else(|| MeshError::ServiceNotFound(service_id.clone()))?
            .instances
            .remove(instance_id)
            .ok_or_else(|| MeshError::InstanceNotFound {
                service_id: service_id.clone(),
                instance_id: instance_id.clone(),
            })?;
        debug!(%service_id, %instance_id, "instance removed");
        self.publish(RegistryEvent::InstanceRemoved {
            service_id: service_id.clone(),
            instance_id: instance_id.clone(),
        });
        Ok(instance)
    }

    /// Definition of a registered service.
    pub fn get_service(&self, service_id: &ServiceId) -> Option<ServiceDefinition> {
        self.services
            .read()
            .get(service_id)
            .map(|entry| entry.definition.clone())
    }

    /// Every registered service, ordered by id.
    pub fn services(&self) -> Vec<ServiceDefinition> {
        self.services
            .read()
            .values()
            .map(|entry| entry.definition.clone())
            .collect()
    }

    /// Registered services carrying `tag`, or all of them.
    pub fn discover_services(&self, tag: Option<&str>) -> Vec<ServiceDefinition> {
        self.services
            .read()
            .values()
            .filter(|entry| tag.map_or(true, |tag| entry.definition.tags.contains(tag)))
            .map(|entry| entry.definition.clone())
            .collect()
    }

    /// Every instance of a service, ordered by id.
    pub fn instances(&self, service_id: &ServiceId) -> MeshResult<Vec<ServiceInstance>> {
        self.services
            .read()
            .get(service_id)
            .map(|entry| entry.instances.values().cloned().collect())
            .ok_or_else(|| MeshError::ServiceNotFound(service_id.clone()))
    }

    /// Healthy instances of a service, ordered by id. May be empty.
    pub fn healthy_instances(&self, service_id: &ServiceId) -> MeshResult<Vec<ServiceInstance>> {
        let mut instances = self.instances(service_id)?;
        instances.retain(|instance| instance.healthy);
        Ok(instances)
    }

    /// Overrides an instance's health flag until the next health check.
    pub fn set_instance_health(
        &self,
        service_id: &ServiceId,
        instance_id: &InstanceId,
        healthy: bool,
    ) -> MeshResult<()> {
        let changed = {
            let mut services = self.services.write();
            let instance = services
                .get_mut(service_id)
                .ok_or_else(|| MeshError::ServiceNotFound(service_id.clone()))?
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| MeshError::InstanceNotFound {
                    service_id: service_id.clone(),
                    instance_id: instance_id.clone(),
                })?;
            std::mem::replace(&mut instance.healthy, healthy) != healthy
        };
        if changed {
            self.publish(RegistryEvent::HealthChanged {
                service_id: service_id.clone(),
                instance_id: instance_id.clone(),
                healthy,
            });
        }
        Ok(())
    }

    /// Counts a call in flight on an instance until the guard drops.
    pub(super) fn track_connection(
        &self,
        service_id: &ServiceId,
        instance_id: &InstanceId,
    ) -> ConnectionGuard<'_> {
        self.adjust_connections(service_id, instance_id, true);
        ConnectionGuard {
            registry: self,
            service_id: service_id.clone(),
            instance_id: instance_id.clone(),
        }
    }

    fn adjust_connections(&self, service_id: &ServiceId, instance_id: &InstanceId, open: bool) {
        let mut services = self.services.write();
        let Some(instance) = services
            .get_mut(service_id)
            .and_then(|entry| entry.instances.get_mut(instance_id))
        else {
            return;
        };
        instance.active_connections = if open {
            instance.active_connections.saturating_add(1)
        } else {
            instance.active_connections.saturating_sub(1)
        };
    }

    /// Probes every instance once and applies the results.
    ///
    /// Returns each instance's health keyed by service and instance id.
    #[instrument(skip(self))]
    pub async fn check_health(&self) -> BTreeMap<(ServiceId, InstanceId), bool> {
        let targets: Vec<ProbeTarget> = self
            .services
            .read()
            .values()
            .flat_map(|entry| {
                entry.instances.values().map(|instance| ProbeTarget {
                    instance: instance.clone(),
                    endpoint: entry.definition.health_endpoint.clone(),
                })
            })
            .collect();

        let timeout = self.health_check_timeout.as_duration();
        let results = join_all(targets.into_iter().map(|target| async move {
            let healthy = match &target.endpoint {
                None => true,
                Some(endpoint) => {
                    let probe = self.probe.probe(&target.instance, endpoint);
                    match tokio::time::timeout(timeout, probe).await {
                        Ok(Ok(())) => true,
                        Ok(Err(error)) => {
                            warn!(instance_id = %target.instance.id, %error, "health probe failed");
                            false
                        }
                        Err(_) => {
                            warn!(instance_id = %target.instance.id, ?timeout, "health probe timed out");
                            false
                        }
                    }
                }
            };
            (target.instance.service_id, target.instance.id, healthy)
        }))
        .await;

        let checked_at = Timestamp::now();
        let mut transitions = Vec::new();
        {
            let mut services = self.services.write();
            for (service_id, instance_id, healthy) in &results {
                let Some(instance) = services
                    .get_mut(service_id)
                    .and_then(|entry| entry.instances.get_mut(instance_id))
                else {
                    continue;
                };
                instance.last_health_check = Some(checked_at);
                if instance.healthy != *healthy {
                    instance.healthy = *healthy;
                    transitions.push(RegistryEvent::HealthChanged {
                        service_id: service_id.clone(),
                        instance_id: instance_id.clone(),
                        healthy: *healthy,
                    });
                }
            }
        }
        for event in transitions {
            if let RegistryEvent::HealthChanged {
                service_id,
                instance_id,
                healthy,
            } = &event
            {
                if *healthy {
                    info!(%service_id, %instance_id, "instance recovered");
                } else {
                    warn!(%service_id, %instance_id, "instance became unhealthy");
                }
            }
            self.publish(event);
        }

        results
            .into_iter()
            .map(|(service_id, instance_id, healthy)| ((service_id, instance_id), healthy))
            .collect()
    }

    /// Starts the periodic health check. Does nothing if it already runs.
    ///
    /// The task holds only a weak reference and ends once the registry is
    /// dropped.
    pub fn start_health_checks(self: &Arc<Self>, interval: TimeoutMs) {
        let mut task = self.health_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let registry: Weak<Self> = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.as_duration());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.check_health().await;
            }
        }));
        info!(interval_ms = interval.into_inner(), "health checks started");
    }

    /// Stops the periodic health check.
    pub fn stop_health_checks(&self) {
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            task.abort();
            info!("health checks stopped");
        }
    }

    /// Whether the periodic health check is running.
    pub fn is_health_checking(&self) -> bool {
        self.health_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Decrements an instance's connection count on drop.
pub(super) struct ConnectionGuard<'a> {
    registry: &'a ServiceRegistry,
    service_id: ServiceId,
    instance_id: InstanceId,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .adjust_connections(&self.service_id, &self.instance_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeProbe {
        down: Mutex<HashSet<u16>>,
        hang: Mutex<HashSet<u16>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, instance: &ServiceInstance, _endpoint: &str) -> MeshResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.lock().contains(&instance.port) {
                std::future::pending::<()>().await;
            }
            if self.down.lock().contains(&instance.port) {
                return Err(MeshError::HealthCheck {
                    instance_id: instance.id.clone(),
                    message: "503".into(),
                });
            }
            Ok(())
        }
    }

    fn service(id: &str) -> ServiceId {
        ServiceId::try_new(id).unwrap()
    }

    fn registry(probe: Arc<FakeProbe>) -> ServiceRegistry {
        ServiceRegistry::new(probe, TimeoutMs::from_millis(50))
    }

    fn orders() -> ServiceDefinition {
        ServiceDefinition::new(service("orders"), "Orders", "localhost", 8080)
            .with_health_endpoint("/health")
            .with_tag("core")
    }

    #[test]
    fn registration_creates_the_initial_instance() {
        let registry = registry(Arc::new(FakeProbe::default()));
        let instance = registry.register_service(orders()).unwrap();

        assert_eq!(instance.port, 8080);
        assert!(instance.healthy);
        assert_eq!(registry.instances(&service("orders")).unwrap(), vec![instance]);
        assert!(matches!(
            registry.register_service(orders()),
            Err(MeshError::DuplicateService(_))
        ));
    }

    #[test]
    fn instances_can_be_added_and_removed() {
        let registry = registry(Arc::new(FakeProbe::default()));
        let mut events = registry.subscribe();
        registry.register_service(orders()).unwrap();
        let second = registry
            .add_instance(&service("orders"), "localhost", 8081, 3)
            .unwrap();
        assert_eq!(registry.instances(&service("orders")).unwrap().len(), 2);

        registry.remove_instance(&service("orders"), &second.id).unwrap();
        assert_eq!(registry.instances(&service("orders")).unwrap().len(), 1);
        assert!(matches!(
            registry.remove_instance(&service("orders"), &second.id),
            Err(MeshError::InstanceNotFound { .. })
        ));

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ServiceRegistered(service("orders"))
        );
    }

    #[test]
    fn discovery_filters_by_tag() {
        let registry = registry(Arc::new(FakeProbe::default()));
        registry.register_service(orders()).unwrap();
        registry
            .register_service(ServiceDefinition::new(service("mail"), "Mail", "localhost", 9000))
            .unwrap();

        assert_eq!(registry.discover_services(Some("core")).len(), 1);
        assert_eq!(registry.discover_services(None).len(), 2);
        assert!(registry.discover_services(Some("edge")).is_empty());
    }

    #[tokio::test]
    async fn health_check_flips_flags_and_notifies() {
        let probe = Arc::new(FakeProbe::default());
        let registry = registry(Arc::clone(&probe));
        registry.register_service(orders()).unwrap();
        let spare = registry
            .add_instance(&service("orders"), "localhost", 8081, 1)
            .unwrap();
        let mut events = registry.subscribe();

        probe.down.lock().insert(8081);
        let health = registry.check_health().await;

        assert!(!health[&(service("orders"), spare.id.clone())]);
        assert_eq!(registry.healthy_instances(&service("orders")).unwrap().len(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::HealthChanged {
                service_id: service("orders"),
                instance_id: spare.id.clone(),
                healthy: false,
            }
        );

        registry.check_health().await;
        assert!(events.try_recv().is_err());

        probe.down.lock().clear();
        registry.check_health().await;
        assert_eq!(registry.healthy_instances(&service("orders")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn hanging_probe_counts_as_unhealthy() {
        let probe = Arc::new(FakeProbe::default());
        let registry = registry(Arc::clone(&probe));
        registry.register_service(orders()).unwrap();
        probe.hang.lock().insert(8080);

        registry.check_health().await;

        assert!(registry.healthy_instances(&service("orders")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn instances_without_endpoint_are_not_probed() {
        let probe = Arc::new(FakeProbe::default());
        let registry = registry(Arc::clone(&probe));
        registry
            .register_service(ServiceDefinition::new(service("mail"), "Mail", "localhost", 9000))
            .unwrap();
        probe.down.lock().insert(9000);

        registry.check_health().await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.healthy_instances(&service("mail")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn periodic_checks_run_until_stopped() {
        let probe = Arc::new(FakeProbe::default());
        let registry = Arc::new(registry(Arc::clone(&probe)));
        registry.register_service(orders()).unwrap();

        registry.start_health_checks(TimeoutMs::from_millis(10));
        assert!(registry.is_health_checking());
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.stop_health_checks();

        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        assert!(!registry.is_health_checking());
    }

    #[test]
    fn connection_guard_counts_calls() {
        let registry = registry(Arc::new(FakeProbe::default()));
        let instance = registry.register_service(orders()).unwrap();
        {
            let _first = registry.track_connection(&service("orders"), &instance.id);
            let _second = registry.track_connection(&service("orders"), &instance.id);
            assert_eq!(
                registry.instances(&service("orders")).unwrap()[0].active_connections,
                2
            );
        }
        assert_eq!(
            registry.instances(&service("orders")).unwrap()[0].active_connections,
            0
        );
    }
}
