use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::SagaAction;
use crate::cqrs::CqrsEngine;
use crate::errors::{ActionError, ActionResult};
use crate::message::Command;
use crate::mesh::{ApiGateway, RouteRequest};

/// Runs saga actions on behalf of the orchestrator.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Runs a step's forward action. `saga_data` is the saga's working data.
    async fn execute(&self, action: &SagaAction, saga_data: &Value) -> ActionResult<Value>;

    /// Runs a compensation. Defaults to running it like any other action.
    async fn execute_compensation(
        &self,
        compensation: &SagaAction,
        saga_data: &Value,
    ) -> ActionResult<Value> {
        self.execute(compensation, saga_data).await
    }
}

/// An in-process function callable from a [`SagaAction::Function`].
#[async_trait]
pub trait SagaFunction: Send + Sync {
    /// Calls the function with the action's data and the saga's working data.
    async fn call(&self, data: &Value, saga_data: &Value) -> ActionResult<Value>;
}

#[async_trait]
impl<F, Fut> SagaFunction for F
where
    F: Fn(Value, Value) -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult<Value>> + Send,
{
    async fn call(&self, data: &Value, saga_data: &Value) -> ActionResult<Value> {
        (self)(data.clone(), saga_data.clone()).await
    }
}

/// Executor that resolves function actions from a registry, command actions
/// through a [`CqrsEngine`] and service actions through an [`ApiGateway`].
///
/// Command and service actions fail with [`ActionError::Unsupported`] when
/// the corresponding collaborator was not supplied.
#[derive(Default)]
pub struct DefaultActionExecutor {
    functions: RwLock<HashMap<String, Arc<dyn SagaFunction>>>,
    engine: Option<Arc<CqrsEngine>>,
    gateway: Option<Arc<ApiGateway>>,
}

impl std::fmt::Debug for DefaultActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultActionExecutor")
            .field("functions", &self.functions.read().keys().collect::<Vec<_>>())
            .field("commands", &self.engine.is_some())
            .field("services", &self.gateway.is_some())
            .finish()
    }
}

impl DefaultActionExecutor {
    /// An executor with no functions and no collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches command actions through `engine`.
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<CqrsEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Sends service actions through `gateway`.
    #[must_use]
    pub fn with_gateway(mut self, gateway: Arc<ApiGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Registers `function` under `name`, replacing any previous one.
    pub fn register_function(&self, name: impl Into<String>, function: Arc<dyn SagaFunction>) {
        let name = name.into();
        debug!(function = %name, "saga function registered");
        self.functions.write().insert(name, function);
    }

    fn function(&self, name: &str) -> ActionResult<Arc<dyn SagaFunction>> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::FunctionNotFound(name.to_string()))
    }
}

#[async_trait]
impl ActionExecutor for DefaultActionExecutor {
    async fn execute(&self, action: &SagaAction, saga_data: &Value) -> ActionResult<Value> {
        match action {
            SagaAction::Function { name, data } => {
                let function = self.function(name)?;
                function.call(data, saga_data).await
            }
            SagaAction::Command {
                command_type,
                aggregate_id,
                payload,
            } => {
                let engine = self
                    .engine
                    .as_ref()
                    .ok_or_else(|| ActionError::Unsupported(action.describe()))?;
                let command =
                    Command::new(command_type.clone(), aggregate_id.clone(), payload.clone());
                let outcome = engine.execute_command(command).await?;
                serde_json::to_value(&outcome.events)
                    .map_err(|error| ActionError::Failed(error.to_string()))
            }
            SagaAction::Service {
                service_id,
                method,
                path,
                body,
            } => {
                let gateway = self
                    .gateway
                    .as_ref()
                    .ok_or_else(|| ActionError::Unsupported(action.describe()))?;
                let mut request =
                    RouteRequest::new(service_id.clone(), method.clone(), path.clone());
                if let Some(body) = body {
                    request = request.with_body(body.clone());
                }
                let response = gateway.route_request(request).await?;
                if response.is_success() {
                    Ok(response.body)
                } else {
                    Err(ActionError::Failed(format!(
                        "{} answered with status {}",
                        service_id, response.status
                    )))
                }
            }
        }
    }
}
