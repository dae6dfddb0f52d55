//! Sagas: multi-step transactions with compensating rollback.
//!
//! A saga runs its steps one at a time, in order. Each step is retried
//! according to its [`RetryPolicy`] and every attempt is bounded by a timeout.
//! When a step exhausts its attempts, the completed steps are compensated in
//! reverse order of completion. The instance is persisted on every state
//! transition so that [`SagaOrchestrator::recover`] can pick up where a
//! crashed process left off.
//!
//! ```text
//! Pending -> Running -> Completed
//!                    -> Compensating -> Compensated
//!                    -> Failed            (no compensation to run)
//! Pending | Running  -> Aborted
//! ```
//!
//! Compensations may run more than once after a crash or a timeout, so they
//! must be idempotent.

mod builder;
mod executor;
mod orchestrator;
mod repository;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TimeoutMs;
use crate::errors::{SagaError, SagaResult};
use crate::retry::RetryPolicy;
use crate::types::{AggregateId, CommandType, SagaDefinitionId, SagaId, ServiceId, StepName, Timestamp};

pub use builder::{SagaDefinitionBuilder, SagaStepBuilder};
pub use executor::{ActionExecutor, DefaultActionExecutor, SagaFunction};
pub use orchestrator::SagaOrchestrator;
pub use repository::SagaRepository;

/// Lifecycle status of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Persisted, not started yet
    Pending,
    /// Executing steps
    Running,
    /// Every step succeeded
    Completed,
    /// A step failed and there was nothing to compensate
    Failed,
    /// Unwinding completed steps
    Compensating,
    /// Unwinding finished
    Compensated,
    /// Stopped by an operator
    Aborted,
}

impl SagaStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Compensating,
        Self::Compensated,
        Self::Aborted,
    ];

    /// Whether the saga will not change state again on its own.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Aborted)
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Number of saga instances in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStatusCounts {
    /// Pending instances
    pub pending: usize,
    /// Running instances
    pub running: usize,
    /// Completed instances
    pub completed: usize,
    /// Failed instances
    pub failed: usize,
    /// Compensating instances
    pub compensating: usize,
    /// Compensated instances
    pub compensated: usize,
    /// Aborted instances
    pub aborted: usize,
}

impl SagaStatusCounts {
    /// Sets the count for `status`.
    pub fn set(&mut self, status: SagaStatus, count: usize) {
        let slot = match status {
            SagaStatus::Pending => &mut self.pending,
            SagaStatus::Running => &mut self.running,
            SagaStatus::Completed => &mut self.completed,
            SagaStatus::Failed => &mut self.failed,
            SagaStatus::Compensating => &mut self.compensating,
            SagaStatus::Compensated => &mut self.compensated,
            SagaStatus::Aborted => &mut self.aborted,
        };
        *slot = count;
    }

    /// Sum over all statuses.
    pub const fn total(&self) -> usize {
        self.pending
            + self.running
            + self.completed
            + self.failed
            + self.compensating
            + self.compensated
            + self.aborted
    }
}

/// What a step (or its compensation) does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SagaAction {
    /// Calls a function registered with the action executor.
    Function {
        /// Registered function name
        name: String,
        /// Argument passed to the function
        data: Value,
    },
    /// Sends a request to a service through the mesh.
    Service {
        /// Target service
        service_id: ServiceId,
        /// HTTP-style method
        method: String,
        /// Request path
        path: String,
        /// Optional request body
        body: Option<Value>,
    },
    /// Dispatches a command through the CQRS engine.
    Command {
        /// Command type
        command_type: CommandType,
        /// Target aggregate
        aggregate_id: AggregateId,
        /// Command payload
        payload: Value,
    },
}

impl SagaAction {
    /// A function action.
    pub fn function(name: impl Into<String>, data: Value) -> Self {
        Self::Function {
            name: name.into(),
            data,
        }
    }

    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Function { name, .. } => format!("function:{name}"),
            Self::Service {
                service_id,
                method,
                path,
                ..
            } => format!("service:{service_id} {method} {path}"),
            Self::Command { command_type, .. } => format!("command:{command_type}"),
        }
    }
}

/// One step of a saga definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    /// Step name, unique within the definition
    pub name: StepName,
    /// The forward action
    pub action: SagaAction,
    /// Undoes the action; `None` when nothing needs undoing
    pub compensation: Option<SagaAction>,
    /// Per-attempt timeout overriding the definition's
    pub timeout: Option<TimeoutMs>,
    /// Retry policy overriding the definition's
    pub retry_policy: Option<RetryPolicy>,
}

/// Static description of a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    /// Definition id
    pub id: SagaDefinitionId,
    /// Human readable name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Steps, executed in order
    pub steps: Vec<SagaStep>,
    /// Per-attempt timeout for steps that set none
    pub timeout: Option<TimeoutMs>,
    /// Retry policy for steps that set none
    pub retry_policy: Option<RetryPolicy>,
}

impl SagaDefinition {
    /// Rejects definitions without steps or with repeated step names.
    pub fn validate(&self) -> SagaResult<()> {
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{}' has no steps",
                self.id
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if self.steps[..index].iter().any(|s| s.name == step.name) {
                return Err(SagaError::InvalidDefinition(format!(
                    "saga '{}' repeats step name '{}'",
                    self.id, step.name
                )));
            }
        }
        Ok(())
    }

    /// Retry policy for the step at `index`.
    pub fn retry_policy_for(&self, index: usize, fallback: RetryPolicy) -> RetryPolicy {
        self.steps
            .get(index)
            .and_then(|step| step.retry_policy)
            .or(self.retry_policy)
            .unwrap_or(fallback)
    }

    /// Attempt timeout for the step at `index`.
    pub fn timeout_for(&self, index: usize, fallback: TimeoutMs) -> TimeoutMs {
        self.steps
            .get(index)
            .and_then(|step| step.timeout)
            .or(self.timeout)
            .unwrap_or(fallback)
    }
}

/// A running or finished saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Instance id
    pub id: SagaId,
    /// The definition it executes
    pub definition_id: SagaDefinitionId,
    /// Current status
    pub status: SagaStatus,
    /// Index of the step being executed or last executed
    pub current_step: usize,
    /// Indices of completed steps, in completion order
    pub completed_steps: Vec<usize>,
    /// Indices of steps that exhausted their attempts
    pub failed_steps: Vec<usize>,
    /// Indices of compensated steps, in compensation order
    pub compensated_steps: Vec<usize>,
    /// Working data supplied when the saga was started
    pub data: Value,
    /// Last step failure, if any
    pub error: Option<String>,
    /// When the saga was started (or last retried)
    pub started_at: Timestamp,
    /// When the saga reached its current final status
    pub ended_at: Option<Timestamp>,
}

impl SagaInstance {
    /// A fresh pending instance of `definition_id`.
    pub fn new(definition_id: SagaDefinitionId, data: Value) -> Self {
        Self {
            id: SagaId::generate(),
            definition_id,
            status: SagaStatus::Pending,
            current_step: 0,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            data,
            error: None,
            started_at: Timestamp::now(),
            ended_at: None,
        }
    }

    /// Index of the first step that has not completed.
    pub fn next_step(&self) -> usize {
        self.completed_steps.last().map_or(0, |last| last + 1)
    }

    /// Completed steps that still need compensating, most recent first.
    pub fn pending_compensations(&self) -> Vec<usize> {
        self.completed_steps
            .iter()
            .rev()
            .copied()
            .filter(|index| !self.compensated_steps.contains(index))
            .collect()
    }

    fn finish(&mut self, status: SagaStatus) {
        self.status = status;
        self.ended_at = Some(Timestamp::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffMultiplier, DelayMs, MaxAttempts};
    use serde_json::json;

    fn step(name: &str) -> SagaStep {
        SagaStep {
            name: StepName::try_new(name).unwrap(),
            action: SagaAction::function(name, json!({})),
            compensation: None,
            timeout: None,
            retry_policy: None,
        }
    }

    fn definition(steps: Vec<SagaStep>) -> SagaDefinition {
        SagaDefinition {
            id: SagaDefinitionId::try_new("order").unwrap(),
            name: "order".into(),
            description: None,
            steps,
            timeout: None,
            retry_policy: None,
        }
    }

    #[test]
    fn empty_and_repeated_steps_are_invalid() {
        assert!(matches!(
            definition(vec![]).validate(),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(matches!(
            definition(vec![step("a"), step("a")]).validate(),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(definition(vec![step("a"), step("b")]).validate().is_ok());
    }

    #[test]
    fn step_settings_override_definition_settings() {
        let mut def = definition(vec![step("a"), step("b")]);
        def.timeout = Some(TimeoutMs::from_millis(500));
        def.steps[1].timeout = Some(TimeoutMs::from_millis(50));
        def.steps[1].retry_policy = Some(RetryPolicy::new(
            MaxAttempts::try_new(7).unwrap(),
            DelayMs::new(1),
            BackoffMultiplier::default(),
            DelayMs::new(1),
        ));

        let fallback = TimeoutMs::default();
        assert_eq!(def.timeout_for(0, fallback), TimeoutMs::from_millis(500));
        assert_eq!(def.timeout_for(1, fallback), TimeoutMs::from_millis(50));
        assert_eq!(def.retry_policy_for(0, RetryPolicy::default()).attempts(), 3);
        assert_eq!(def.retry_policy_for(1, RetryPolicy::default()).attempts(), 7);
    }

    #[test]
    fn pending_compensations_are_reverse_completion_order() {
        let mut instance =
            SagaInstance::new(SagaDefinitionId::try_new("order").unwrap(), json!({}));
        instance.completed_steps = vec![0, 1, 2];
        instance.compensated_steps = vec![2];

        assert_eq!(instance.pending_compensations(), vec![1, 0]);
        assert_eq!(instance.next_step(), 3);
    }

    #[test]
    fn status_serializes_in_upper_case() {
        assert_eq!(
            serde_json::to_value(SagaStatus::Compensated).unwrap(),
            json!("COMPENSATED")
        );
        assert!(SagaStatus::Aborted.is_terminal());
        assert!(!SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn action_is_tagged_by_type() {
        let action = SagaAction::function("reserve", json!({"sku": 1}));
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"type": "function", "name": "reserve", "data": {"sku": 1}})
        );
    }
}
