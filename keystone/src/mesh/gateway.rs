use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use super::{
    MeshClient, RequestRecord, ServiceDefinition, ServiceHealth, ServiceRegistry, ServiceRequest,
    ServiceResponse, SystemHealth,
};
use crate::config::TimeoutMs;
use crate::errors::MeshResult;
use crate::metrics::MeshMetricsSummary;
use crate::types::{RequestId, ServiceId};

/// A call routed through the [`ApiGateway`]. The gateway assigns the
/// request id.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct RouteRequest {
    /// Target service
    pub service_id: ServiceId,
    /// Method, such as `POST`
    pub method: String,
    /// Path below the instance root
    pub path: String,
    /// JSON body
    pub body: Option<Value>,
    /// Headers
    pub headers: BTreeMap<String, String>,
    /// Attempt timeout
    pub timeout: Option<TimeoutMs>,
    /// Routing key for key-hash balancing
    pub routing_key: Option<String>,
}

impl RouteRequest {
    /// A request without body, headers or timeout.
    pub fn new(service_id: ServiceId, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service_id,
            method: method.into(),
            path: path.into(),
            body: None,
            headers: BTreeMap::new(),
            timeout: None,
            routing_key: None,
        }
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the attempt timeout.
    pub const fn with_timeout(mut self, timeout: TimeoutMs) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the routing key.
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }
}

impl From<RouteRequest> for ServiceRequest {
    fn from(route: RouteRequest) -> Self {
        Self {
            id: RequestId::generate(),
            service_id: route.service_id,
            method: route.method,
            path: route.path,
            headers: route.headers,
            body: route.body,
            timeout: route.timeout,
            routing_key: route.routing_key,
        }
    }
}

/// Entry point for calls into the mesh and for discovery and health
/// queries.
#[derive(Debug, Clone)]
pub struct ApiGateway {
    client: Arc<MeshClient>,
}

impl ApiGateway {
    /// A gateway in front of `client`.
    pub const fn new(client: Arc<MeshClient>) -> Self {
        Self { client }
    }

    /// The underlying client.
    pub const fn client(&self) -> &Arc<MeshClient> {
        &self.client
    }

    /// The registry behind the client.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.client.registry()
    }

    /// Assigns a request id and sends the request.
    #[instrument(skip(self, route), fields(service_id = %route.service_id, path = %route.path))]
    pub async fn route_request(&self, route: RouteRequest) -> MeshResult<ServiceResponse> {
        let request = ServiceRequest::from(route);
        self.client.request(&request).await
    }

    /// Registered services carrying `tag`, or all of them.
    pub fn discover_services(&self, tag: Option<&str>) -> Vec<ServiceDefinition> {
        self.registry().discover_services(tag)
    }

    /// Health of one service.
    pub fn get_service_health(&self, service_id: &ServiceId) -> MeshResult<ServiceHealth> {
        self.client.get_service_health(service_id)
    }

    /// Health of every registered service.
    pub fn get_system_health(&self) -> SystemHealth {
        self.client.get_system_health()
    }

    /// Retained request records.
    pub fn get_metrics(
        &self,
        service_id: Option<&ServiceId>,
        limit: Option<usize>,
    ) -> Vec<RequestRecord> {
        self.client.get_metrics(service_id, limit)
    }

    /// Request totals.
    pub fn summary(&self) -> MeshMetricsSummary {
        self.client.summary()
    }
}
