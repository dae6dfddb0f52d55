//! HTTP transport and health probe built on `reqwest`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use super::{HealthProbe, ServiceInstance, ServiceRequest, ServiceTransport, TransportResponse};
use crate::errors::{MeshError, MeshResult};

/// Sends mesh requests as HTTP requests with JSON bodies.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// A transport over an existing client.
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

fn transport_error(instance: &ServiceInstance, error: impl std::fmt::Display) -> MeshError {
    MeshError::Transport {
        service_id: instance.service_id.clone(),
        message: error.to_string(),
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    async fn send(
        &self,
        instance: &ServiceInstance,
        request: &ServiceRequest,
    ) -> MeshResult<TransportResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|error| transport_error(instance, error))?;
        let mut builder = self.client.request(method, instance.url(&request.path));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = builder.header("x-request-id", request.id.to_string());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| transport_error(instance, error))?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| transport_error(instance, error))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Treats a 2xx answer to `GET <endpoint>` as healthy.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    /// A probe over an existing client.
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, instance: &ServiceInstance, endpoint: &str) -> MeshResult<()> {
        let response = self
            .client
            .get(instance.url(endpoint))
            .send()
            .await
            .map_err(|error| MeshError::HealthCheck {
                instance_id: instance.id.clone(),
                message: error.to_string(),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(MeshError::HealthCheck {
                instance_id: instance.id.clone(),
                message: format!("status {}", response.status()),
            })
        }
    }
}
