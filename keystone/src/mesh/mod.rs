//! Service mesh: registry, circuit breakers, load balancing and a gateway.
//!
//! The [`ServiceRegistry`] holds service definitions and their instances
//! and keeps each instance's health flag current. The [`MeshClient`] picks a
//! healthy instance with a [`LoadBalancer`], guards the call with the
//! service's [`CircuitBreaker`], and records every request. The
//! [`ApiGateway`] is the entry point for callers.
//!
//! Network access goes through two ports, [`ServiceTransport`] and
//! [`HealthProbe`]. Reqwest based implementations live in [`http`] behind
//! the `http` feature.

mod balancer;
mod circuit_breaker;
mod client;
mod gateway;
#[cfg(feature = "http")]
pub mod http;
mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{FailureThreshold, HalfOpenSuccesses, TimeoutMs};
use crate::errors::MeshResult;
use crate::retry::RetryPolicy;
use crate::types::{InstanceId, RequestId, ServiceId, Timestamp};

pub use balancer::LoadBalancer;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use client::MeshClient;
pub use gateway::{ApiGateway, RouteRequest};
pub use registry::{RegistryEvent, ServiceRegistry};

/// Wire protocol of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP
    #[default]
    Http,
    /// HTTP over TLS
    Https,
    /// gRPC
    Grpc,
    /// Raw TCP
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::Grpc => write!(f, "grpc"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// How the mesh client picks among a service's healthy instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Instances in turn
    #[default]
    RoundRobin,
    /// Instances in turn, proportionally to their weight
    WeightedRoundRobin,
    /// The instance with the fewest open calls
    LeastConnections,
    /// A uniformly random instance
    Random,
    /// The instance the request's routing key hashes to
    KeyHash,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: FailureThreshold,
    /// Time after the last failure before a probe is let through.
    pub recovery_timeout: TimeoutMs,
    /// Consecutive probe successes that close the circuit again.
    pub half_open_successes: HalfOpenSuccesses,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FailureThreshold::default(),
            recovery_timeout: TimeoutMs::from_millis(60_000),
            half_open_successes: HalfOpenSuccesses::default(),
        }
    }
}

/// A service known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service id
    pub id: ServiceId,
    /// Human readable name
    pub name: String,
    /// Deployed version
    #[serde(default)]
    pub version: String,
    /// Wire protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Host of the initial instance
    pub host: String,
    /// Port of the initial instance
    pub port: u16,
    /// Health endpoint path; instances without one are always healthy
    #[serde(default)]
    pub health_endpoint: Option<String>,
    /// Discovery tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Breaker settings overriding the mesh defaults
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Retry policy for transient transport failures; none means one attempt
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Instance selection
    #[serde(default)]
    pub load_balancing: LoadBalancingStrategy,
}

impl ServiceDefinition {
    /// An HTTP service with one instance at `host:port` and no health
    /// endpoint.
    pub fn new(id: ServiceId, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            name: name.into(),
            version: "1.0.0".to_string(),
            protocol: Protocol::Http,
            host: host.into(),
            port,
            health_endpoint: None,
            tags: BTreeSet::new(),
            circuit_breaker: None,
            retry_policy: None,
            load_balancing: LoadBalancingStrategy::RoundRobin,
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the protocol.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the health endpoint path.
    #[must_use]
    pub fn with_health_endpoint(mut self, path: impl Into<String>) -> Self {
        self.health_endpoint = Some(path.into());
        self
    }

    /// Adds a discovery tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Overrides the breaker settings.
    #[must_use]
    pub const fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Retries transient failures with `policy`.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the load-balancing strategy.
    #[must_use]
    pub const fn with_load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }
}

/// One running copy of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance id
    pub id: InstanceId,
    /// Owning service
    pub service_id: ServiceId,
    /// Wire protocol
    pub protocol: Protocol,
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// Weight for weighted round robin
    pub weight: u32,
    /// Result of the last health check
    pub healthy: bool,
    /// Calls currently in flight
    pub active_connections: usize,
    /// When the instance was last probed
    pub last_health_check: Option<Timestamp>,
}

impl ServiceInstance {
    /// `scheme://host:port` followed by `path`.
    pub fn url(&self, path: &str) -> String {
        let scheme = match self.protocol {
            Protocol::Https => "https",
            _ => "http",
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }
}

/// A call to a service, as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Request id
    pub id: RequestId,
    /// Target service
    pub service_id: ServiceId,
    /// Method, such as `GET`
    pub method: String,
    /// Path below the instance root
    pub path: String,
    /// Headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body
    #[serde(default)]
    pub body: Option<Value>,
    /// Attempt timeout; the mesh default applies when unset
    #[serde(default)]
    pub timeout: Option<TimeoutMs>,
    /// Routing key for key-hash balancing
    #[serde(default)]
    pub routing_key: Option<String>,
}

impl ServiceRequest {
    /// A request without body, headers or timeout.
    pub fn new(service_id: ServiceId, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: RequestId::generate(),
            service_id,
            method: method.into(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            routing_key: None,
        }
    }
}

/// What a transport returns for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    /// Status code
    pub status: u16,
    /// Headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body, `null` when empty
    #[serde(default)]
    pub body: Value,
}

/// A service's answer to a [`ServiceRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// The request answered
    pub request_id: RequestId,
    /// Status code
    pub status: u16,
    /// Headers
    pub headers: BTreeMap<String, String>,
    /// JSON body
    pub body: Value,
    /// Time the successful attempt took
    pub duration: Duration,
    /// Instance that answered
    pub instance_id: InstanceId,
}

impl ServiceResponse {
    /// Whether the status is 2xx.
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Record of one request attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Request id
    pub request_id: RequestId,
    /// Target service
    pub service_id: ServiceId,
    /// Chosen instance, if one was available
    pub instance_id: Option<InstanceId>,
    /// Method
    pub method: String,
    /// Path
    pub path: String,
    /// Response status, if a response arrived
    pub status: Option<u16>,
    /// Attempt duration
    pub duration: Duration,
    /// When the attempt finished
    pub timestamp: Timestamp,
    /// Failure, if any
    pub error: Option<String>,
}

impl RequestRecord {
    /// A response below 400 arrived.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|status| status < 400)
    }
}

/// Coarse health of a service or of the whole mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every instance is healthy and the circuit is closed.
    Healthy,
    /// Some instances are unhealthy or the circuit is not closed.
    Degraded,
    /// No instance is healthy.
    Unhealthy,
}

/// Health of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Service id
    pub service_id: ServiceId,
    /// Overall status
    pub status: HealthStatus,
    /// Healthy instances
    pub healthy_instances: usize,
    /// All instances
    pub total_instances: usize,
    /// State of the service's circuit breaker
    pub circuit_state: CircuitState,
    /// Mean duration of the retained requests to this service, in ms
    pub average_response_time_ms: f64,
    /// Share of the retained requests to this service that failed
    pub error_rate: f64,
}

/// Health of every registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Worst status over all services; healthy when there are none
    pub status: HealthStatus,
    /// Per-service health
    pub services: BTreeMap<ServiceId, ServiceHealth>,
    /// When the report was built
    pub timestamp: Timestamp,
}

/// Carries requests to service instances.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    /// Sends `request` to `instance`. Any status code is a response; only
    /// failures to get one are errors.
    async fn send(
        &self,
        instance: &ServiceInstance,
        request: &ServiceRequest,
    ) -> MeshResult<TransportResponse>;
}

/// Checks an instance's health endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the endpoint reports healthy.
    async fn probe(&self, instance: &ServiceInstance, endpoint: &str) -> MeshResult<()>;
}
