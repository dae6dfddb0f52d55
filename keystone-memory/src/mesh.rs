use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keystone::errors::{MeshError, MeshResult};
use keystone::mesh::{
    HealthProbe, ServiceInstance, ServiceRequest, ServiceTransport, TransportResponse,
};
use keystone::types::{InstanceId, ServiceId};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

/// How the in-memory transport answers a request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportBehaviour {
    /// `200` with the request echoed back.
    Echo,
    /// A fixed status and body.
    Respond {
        /// Status code
        status: u16,
        /// Body
        body: Value,
    },
    /// A transport failure.
    Fail(String),
    /// Never answers; only a timeout ends the call.
    Hang,
}

/// A mesh transport that answers from configured behaviours.
///
/// Behaviours are looked up by instance, then by service; without either
/// the request is echoed.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    by_instance: Arc<RwLock<HashMap<InstanceId, TransportBehaviour>>>,
    by_service: Arc<RwLock<HashMap<ServiceId, TransportBehaviour>>>,
    sent: Arc<Mutex<Vec<(InstanceId, ServiceRequest)>>>,
    calls: Arc<AtomicU64>,
}

impl InMemoryTransport {
    /// A transport that echoes everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the behaviour of every instance of `service_id`.
    pub fn set_service_behaviour(&self, service_id: ServiceId, behaviour: TransportBehaviour) {
        self.by_service.write().insert(service_id, behaviour);
    }

    /// Sets the behaviour of one instance, overriding its service's.
    pub fn set_instance_behaviour(&self, instance_id: InstanceId, behaviour: TransportBehaviour) {
        self.by_instance.write().insert(instance_id, behaviour);
    }

    /// Requests received so far, with the instance they reached.
    pub fn sent(&self) -> Vec<(InstanceId, ServiceRequest)> {
        self.sent.lock().clone()
    }

    /// Number of `send` calls, including failed and hanging ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn behaviour(&self, instance: &ServiceInstance) -> TransportBehaviour {
        let by_instance = self.by_instance.read().get(&instance.id).cloned();
        by_instance
            .or_else(|| self.by_service.read().get(&instance.service_id).cloned())
            .unwrap_or(TransportBehaviour::Echo)
    }
}

#[async_trait]
impl ServiceTransport for InMemoryTransport {
    async fn send(
        &self,
        instance: &ServiceInstance,
        request: &ServiceRequest,
    ) -> MeshResult<TransportResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push((instance.id.clone(), request.clone()));

        match self.behaviour(instance) {
            TransportBehaviour::Echo => Ok(TransportResponse {
                status: 200,
                headers: request.headers.clone(),
                body: json!({
                    "instance": instance.id.as_ref(),
                    "method": request.method,
                    "path": request.path,
                    "body": request.body,
                }),
            }),
            TransportBehaviour::Respond { status, body } => Ok(TransportResponse {
                status,
                headers: BTreeMap::new(),
                body,
            }),
            TransportBehaviour::Fail(message) => Err(MeshError::Transport {
                service_id: instance.service_id.clone(),
                message,
            }),
            TransportBehaviour::Hang => std::future::pending().await,
        }
    }
}

/// A health probe whose answers are set by hand. Instances are healthy
/// until marked otherwise.
#[derive(Debug, Clone, Default)]
pub struct StaticHealthProbe {
    unhealthy: Arc<RwLock<HashSet<InstanceId>>>,
    probes: Arc<AtomicU64>,
}

impl StaticHealthProbe {
    /// A probe reporting every instance healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the answer for `instance_id`.
    pub fn set_healthy(&self, instance_id: &InstanceId, healthy: bool) {
        let mut unhealthy = self.unhealthy.write();
        if healthy {
            unhealthy.remove(instance_id);
        } else {
            unhealthy.insert(instance_id.clone());
        }
    }

    /// Number of probes answered.
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn probe(&self, instance: &ServiceInstance, endpoint: &str) -> MeshResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.unhealthy.read().contains(&instance.id) {
            Err(MeshError::HealthCheck {
                instance_id: instance.id.clone(),
                message: format!("{} reported unhealthy", instance.url(endpoint)),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone::mesh::Protocol;
    use keystone::types::RequestId;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn instance(service: &str, id: &str) -> ServiceInstance {
        ServiceInstance {
            id: InstanceId::try_new(id).unwrap(),
            service_id: ServiceId::try_new(service).unwrap(),
            protocol: Protocol::Http,
            host: "localhost".into(),
            port: 9000,
            weight: 1,
            healthy: true,
            active_connections: 0,
            last_health_check: None,
        }
    }

    fn request(service: &str) -> ServiceRequest {
        ServiceRequest {
            id: RequestId::generate(),
            service_id: ServiceId::try_new(service).unwrap(),
            method: "POST".into(),
            path: "/orders".into(),
            headers: BTreeMap::new(),
            body: Some(json!({"qty": 2})),
            timeout: None,
            routing_key: None,
        }
    }

    #[tokio::test]
    async fn echoes_by_default() {
        let transport = InMemoryTransport::new();
        let response = transport
            .send(&instance("orders", "orders-1"), &request("orders"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["instance"], "orders-1");
        assert_eq!(response.body["body"], json!({"qty": 2}));
        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.sent()[0].0.as_ref(), "orders-1");
    }

    #[tokio::test]
    async fn instance_behaviour_overrides_service_behaviour() {
        let transport = InMemoryTransport::new();
        transport.set_service_behaviour(
            ServiceId::try_new("orders").unwrap(),
            TransportBehaviour::Respond {
                status: 503,
                body: Value::Null,
            },
        );
        transport.set_instance_behaviour(
            InstanceId::try_new("orders-2").unwrap(),
            TransportBehaviour::Fail("reset by peer".into()),
        );

        let degraded = transport
            .send(&instance("orders", "orders-1"), &request("orders"))
            .await
            .unwrap();
        assert_eq!(degraded.status, 503);

        let error = transport
            .send(&instance("orders", "orders-2"), &request("orders"))
            .await
            .unwrap_err();
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn hanging_instances_never_answer() {
        let transport = InMemoryTransport::new();
        transport.set_instance_behaviour(
            InstanceId::try_new("orders-1").unwrap(),
            TransportBehaviour::Hang,
        );
        let target = instance("orders", "orders-1");
        let req = request("orders");
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), transport.send(&target, &req)).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn probe_answers_follow_the_flags() {
        let probe = StaticHealthProbe::new();
        let target = instance("orders", "orders-1");
        assert_ok!(probe.probe(&target, "/health").await);

        probe.set_healthy(&target.id, false);
        let error = assert_err!(probe.probe(&target, "/health").await);
        assert!(matches!(error, MeshError::HealthCheck { .. }));

        probe.set_healthy(&target.id, true);
        assert_ok!(probe.probe(&target, "/health").await);
        assert_eq!(probe.probes(), 3);
    }
}
