use super::{SagaAction, SagaDefinition, SagaStep};
use crate::config::TimeoutMs;
use crate::errors::SagaResult;
use crate::retry::RetryPolicy;
use crate::types::{SagaDefinitionId, StepName};

/// Fluent builder for [`SagaDefinition`].
///
/// ```rust,ignore
/// let definition = SagaDefinitionBuilder::new(id, "place order")
///     .step(reserve, SagaAction::function("reserve_stock", json!({})))
///     .compensate(SagaAction::function("release_stock", json!({})))
///     .then()
///     .step(charge, SagaAction::function("charge_card", json!({})))
///     .timeout(TimeoutMs::from_millis(5_000))
///     .then()
///     .build()?;
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct SagaDefinitionBuilder {
    definition: SagaDefinition,
}

impl SagaDefinitionBuilder {
    /// Starts a definition with no steps.
    pub fn new(id: SagaDefinitionId, name: impl Into<String>) -> Self {
        Self {
            definition: SagaDefinition {
                id,
                name: name.into(),
                description: None,
                steps: Vec::new(),
                timeout: None,
                retry_policy: None,
            },
        }
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    /// Attempt timeout for steps that set none.
    pub const fn timeout(mut self, timeout: TimeoutMs) -> Self {
        self.definition.timeout = Some(timeout);
        self
    }

    /// Retry policy for steps that set none.
    pub const fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.definition.retry_policy = Some(policy);
        self
    }

    /// Begins a step running `action`.
    pub fn step(self, name: StepName, action: SagaAction) -> SagaStepBuilder {
        SagaStepBuilder {
            parent: self,
            step: SagaStep {
                name,
                action,
                compensation: None,
                timeout: None,
                retry_policy: None,
            },
        }
    }

    /// Validates and returns the definition.
    pub fn build(self) -> SagaResult<SagaDefinition> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}

/// Builder for one step; [`then`](Self::then) returns to the definition.
#[derive(Debug, Clone)]
#[must_use]
pub struct SagaStepBuilder {
    parent: SagaDefinitionBuilder,
    step: SagaStep,
}

impl SagaStepBuilder {
    /// Action that undoes this step.
    pub fn compensate(mut self, compensation: SagaAction) -> Self {
        self.step.compensation = Some(compensation);
        self
    }

    /// Attempt timeout for this step.
    pub const fn timeout(mut self, timeout: TimeoutMs) -> Self {
        self.step.timeout = Some(timeout);
        self
    }

    /// Retry policy for this step.
    pub const fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.step.retry_policy = Some(policy);
        self
    }

    /// Finishes the step.
    pub fn then(mut self) -> SagaDefinitionBuilder {
        self.parent.definition.steps.push(self.step);
        self.parent
    }
}
