use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{ActionExecutor, SagaDefinition, SagaInstance, SagaRepository, SagaStatus, SagaStatusCounts};
use crate::config::SagaConfig;
use crate::errors::{ActionError, SagaError, SagaResult};
use crate::types::{SagaDefinitionId, SagaId, Timestamp};

/// Per-instance control shared between the executing task and operators.
#[derive(Debug, Default)]
struct SagaControl {
    aborted: AtomicBool,
    // Serializes checkpoints with aborts so an abort is never overwritten.
    checkpoint: tokio::sync::Mutex<()>,
}

impl SagaControl {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Forward,
    Compensate,
}

struct Inner<R: ?Sized> {
    config: SagaConfig,
    executor: Arc<dyn ActionExecutor>,
    definitions: RwLock<HashMap<SagaDefinitionId, Arc<SagaDefinition>>>,
    controls: Mutex<HashMap<SagaId, Arc<SagaControl>>>,
    tasks: Mutex<HashMap<SagaId, JoinHandle<()>>>,
    repository: Arc<R>,
}

/// Drives saga instances through their steps.
///
/// Cloning is cheap; clones share definitions, running instances and the
/// repository.
pub struct SagaOrchestrator<R: ?Sized> {
    inner: Arc<Inner<R>>,
}

impl<R: ?Sized> Clone for SagaOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ?Sized> std::fmt::Debug for SagaOrchestrator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("definitions", &self.inner.definitions.read().len())
            .field("active", &self.inner.controls.lock().len())
            .finish_non_exhaustive()
    }
}

impl<R: SagaRepository + ?Sized + 'static> SagaOrchestrator<R> {
    /// Creates an orchestrator persisting into `repository`.
    pub fn new(repository: Arc<R>, executor: Arc<dyn ActionExecutor>, config: SagaConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                definitions: RwLock::new(HashMap::new()),
                controls: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                repository,
            }),
        }
    }

    /// The saga repository.
    pub fn repository(&self) -> &Arc<R> {
        &self.inner.repository
    }

    /// Validates and registers a definition, replacing one with the same id.
    ///
    /// Registered definitions are what [`recover`](Self::recover) and
    /// [`retry_saga`](Self::retry_saga) resume with.
    pub fn register_definition(&self, definition: SagaDefinition) -> SagaResult<Arc<SagaDefinition>> {
        definition.validate()?;
        let definition = Arc::new(definition);
        self.inner
            .definitions
            .write()
            .insert(definition.id.clone(), Arc::clone(&definition));
        debug!(definition_id = %definition.id, steps = definition.steps.len(), "saga definition registered");
        Ok(definition)
    }

    /// A registered definition.
    pub fn definition(&self, id: &SagaDefinitionId) -> Option<Arc<SagaDefinition>> {
        self.inner.definitions.read().get(id).cloned()
    }

    fn require_definition(&self, id: &SagaDefinitionId) -> SagaResult<Arc<SagaDefinition>> {
        self.definition(id)
            .ok_or_else(|| SagaError::DefinitionNotFound(id.clone()))
    }

    fn ensure_enabled(&self) -> SagaResult<()> {
        if self.inner.config.enabled {
            Ok(())
        } else {
            Err(SagaError::Disabled)
        }
    }

    /// Persists a pending instance and executes it in the background.
    ///
    /// Returns the pending instance; use [`wait`](Self::wait) or
    /// [`get_saga`](Self::get_saga) to observe progress.
    #[instrument(skip(self, definition, data), fields(definition_id = %definition.id))]
    pub async fn start_saga(&self, definition: SagaDefinition, data: Value) -> SagaResult<SagaInstance> {
        self.ensure_enabled()?;
        let definition = self.register_definition(definition)?;
        let instance = SagaInstance::new(definition.id.clone(), data);
        self.inner.repository.save(&instance).await?;
        info!(saga_id = %instance.id, "saga started");
        self.spawn(instance.clone(), definition, Phase::Forward);
        Ok(instance)
    }

    /// Persists a pending instance and executes it to a final status before
    /// returning.
    #[instrument(skip(self, definition, data), fields(definition_id = %definition.id))]
    pub async fn execute_saga(&self, definition: SagaDefinition, data: Value) -> SagaResult<SagaInstance> {
        self.ensure_enabled()?;
        let definition = self.register_definition(definition)?;
        let instance = SagaInstance::new(definition.id.clone(), data);
        self.inner.repository.save(&instance).await?;
        info!(saga_id = %instance.id, "saga started");

        let control = self.inner.track(instance.id);
        let id = instance.id;
        let result = self
            .inner
            .drive(&control, &definition, instance, Phase::Forward)
            .await;
        self.inner.controls.lock().remove(&id);
        result
    }

    fn spawn(&self, instance: SagaInstance, definition: Arc<SagaDefinition>, phase: Phase) {
        let id = instance.id;
        let control = self.inner.track(id);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = inner.drive(&control, &definition, instance, phase).await;
            inner.controls.lock().remove(&id);
            if let Err(error) = result {
                error!(saga_id = %id, %error, "saga execution stopped");
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, handle);
    }

    /// Waits for the background execution of `id` (if any) and returns the
    /// persisted instance.
    pub async fn wait(&self, id: &SagaId) -> SagaResult<SagaInstance> {
        let task = self.inner.tasks.lock().remove(id);
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(saga_id = %id, %error, "saga task did not finish cleanly");
            }
        }
        self.get_saga(id)
            .await?
            .ok_or(SagaError::NotFound(*id))
    }

    /// The persisted instance.
    pub async fn get_saga(&self, id: &SagaId) -> SagaResult<Option<SagaInstance>> {
        self.inner.repository.find_by_id(id).await
    }

    /// The persisted status.
    pub async fn get_saga_status(&self, id: &SagaId) -> SagaResult<Option<SagaStatus>> {
        Ok(self.get_saga(id).await?.map(|saga| saga.status))
    }

    /// Stops a pending or running saga. Completed steps are not compensated.
    #[instrument(skip(self))]
    pub async fn abort_saga(&self, id: &SagaId) -> SagaResult<SagaInstance> {
        let control = self.inner.controls.lock().get(id).cloned();
        let _checkpoint = match &control {
            Some(control) => Some(control.checkpoint.lock().await),
            None => None,
        };

        let mut saga = self
            .inner
            .repository
            .find_by_id(id)
            .await?
            .ok_or(SagaError::NotFound(*id))?;
        if !matches!(saga.status, SagaStatus::Pending | SagaStatus::Running) {
            return Err(SagaError::InvalidState {
                saga_id: *id,
                status: saga.status,
                operation: "abort",
            });
        }

        if let Some(control) = &control {
            control.aborted.store(true, Ordering::Release);
        }
        saga.finish(SagaStatus::Aborted);
        self.inner.repository.save(&saga).await?;
        info!(saga_id = %id, step = saga.current_step, "saga aborted");
        Ok(saga)
    }

    /// Resumes a failed saga from its first incomplete step.
    #[instrument(skip(self))]
    pub async fn retry_saga(&self, id: &SagaId) -> SagaResult<SagaInstance> {
        self.ensure_enabled()?;
        let mut saga = self
            .inner
            .repository
            .find_by_id(id)
            .await?
            .ok_or(SagaError::NotFound(*id))?;
        if saga.status != SagaStatus::Failed {
            return Err(SagaError::InvalidState {
                saga_id: *id,
                status: saga.status,
                operation: "retry",
            });
        }
        let definition = self.require_definition(&saga.definition_id)?;

        saga.status = SagaStatus::Pending;
        saga.current_step = saga.next_step();
        saga.failed_steps.clear();
        saga.error = None;
        saga.started_at = Timestamp::now();
        saga.ended_at = None;
        self.inner.repository.save(&saga).await?;
        info!(saga_id = %id, from_step = saga.current_step, "saga retried");

        self.spawn(saga.clone(), definition, Phase::Forward);
        Ok(saga)
    }

    /// Resumes sagas left unfinished by a previous process.
    ///
    /// Pending and running sagas continue from their last checkpoint;
    /// compensating sagas finish their unwind. Sagas whose definition is not
    /// registered, or that are already executing here, are skipped.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> SagaResult<Vec<SagaId>> {
        self.ensure_enabled()?;
        let mut resumed = Vec::new();
        for (status, phase) in [
            (SagaStatus::Pending, Phase::Forward),
            (SagaStatus::Running, Phase::Forward),
            (SagaStatus::Compensating, Phase::Compensate),
        ] {
            for saga in self.inner.repository.find_by_status(status).await? {
                if self.inner.controls.lock().contains_key(&saga.id) {
                    continue;
                }
                let Some(definition) = self.definition(&saga.definition_id) else {
                    warn!(
                        saga_id = %saga.id,
                        definition_id = %saga.definition_id,
                        "cannot recover saga without its definition"
                    );
                    continue;
                };
                resumed.push(saga.id);
                self.spawn(saga, definition, phase);
            }
        }
        info!(count = resumed.len(), "sagas recovered");
        Ok(resumed)
    }

    /// Number of persisted instances per status.
    pub async fn status_counts(&self) -> SagaResult<SagaStatusCounts> {
        let mut counts = SagaStatusCounts::default();
        for status in SagaStatus::ALL {
            let count = self.inner.repository.find_by_status(status).await?.len();
            counts.set(status, count);
        }
        Ok(counts)
    }

    /// Stops every background execution. Instances stay persisted at their
    /// last checkpoint and can be resumed with [`recover`](Self::recover).
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().drain().collect();
        for (id, task) in tasks {
            if !task.is_finished() {
                debug!(saga_id = %id, "stopping saga task");
                task.abort();
            }
        }
        self.inner.controls.lock().clear();
    }
}

impl<R: SagaRepository + ?Sized> Inner<R> {
    fn track(&self, id: SagaId) -> Arc<SagaControl> {
        let control = Arc::new(SagaControl::default());
        self.controls.lock().insert(id, Arc::clone(&control));
        control
    }

    /// Persists the instance unless the saga was aborted meanwhile.
    async fn checkpoint(&self, control: &SagaControl, saga: &SagaInstance) -> SagaResult<bool> {
        let _guard = control.checkpoint.lock().await;
        if control.is_aborted() {
            return Ok(false);
        }
        self.repository.save(saga).await?;
        Ok(true)
    }

    async fn aborted(&self, id: SagaId) -> SagaResult<SagaInstance> {
        self.repository
            .find_by_id(&id)
            .await?
            .ok_or(SagaError::NotFound(id))
    }

    async fn drive(
        &self,
        control: &SagaControl,
        definition: &SagaDefinition,
        saga: SagaInstance,
        phase: Phase,
    ) -> SagaResult<SagaInstance> {
        match phase {
            Phase::Forward => self.run_forward(control, definition, saga).await,
            Phase::Compensate => self.compensate(control, definition, saga).await,
        }
    }

    async fn run_forward(
        &self,
        control: &SagaControl,
        definition: &SagaDefinition,
        mut saga: SagaInstance,
    ) -> SagaResult<SagaInstance> {
        saga.status = SagaStatus::Running;
        if !self.checkpoint(control, &saga).await? {
            return self.aborted(saga.id).await;
        }

        for index in saga.next_step()..definition.steps.len() {
            if control.is_aborted() {
                return self.aborted(saga.id).await;
            }
            saga.current_step = index;
            if !self.checkpoint(control, &saga).await? {
                return self.aborted(saga.id).await;
            }

            let step = &definition.steps[index];
            let policy = definition.retry_policy_for(index, self.config.retry_policy);
            let timeout = definition
                .timeout_for(index, self.config.default_step_timeout)
                .as_duration();
            let executor = &self.executor;
            let data = &saga.data;
            let saga_id = saga.id;
            let (result, attempts) = policy
                .run(
                    |attempt| async move {
                        debug!(%saga_id, step = %step.name, attempt, "executing step");
                        tokio::time::timeout(timeout, executor.execute(&step.action, data))
                            .await
                            .unwrap_or_else(|_| Err(ActionError::Timeout(timeout)))
                    },
                    |_| !control.is_aborted(),
                )
                .await;

            match result {
                Ok(_) => {
                    saga.completed_steps.push(index);
                    if !self.checkpoint(control, &saga).await? {
                        return self.aborted(saga.id).await;
                    }
                    debug!(saga_id = %saga.id, step = %step.name, attempts, "step completed");
                }
                Err(action_error) => {
                    if control.is_aborted() {
                        return self.aborted(saga.id).await;
                    }
                    let failure = SagaError::StepFailed {
                        saga_id: saga.id,
                        step: step.name.clone(),
                        attempts,
                        message: action_error.to_string(),
                    };
                    warn!(saga_id = %saga.id, step = %step.name, attempts, error = %action_error, "step failed");
                    saga.failed_steps.push(index);
                    saga.error = Some(failure.to_string());
                    if !self.checkpoint(control, &saga).await? {
                        return self.aborted(saga.id).await;
                    }
                    return self.compensate(control, definition, saga).await;
                }
            }
        }

        saga.finish(SagaStatus::Completed);
        if !self.checkpoint(control, &saga).await? {
            return self.aborted(saga.id).await;
        }
        info!(saga_id = %saga.id, "saga completed");
        Ok(saga)
    }

    /// Compensates completed steps, most recent first. A failing
    /// compensation is logged and the unwind continues. An abort stops the
    /// unwind and leaves the aborted instance as persisted.
    async fn compensate(
        &self,
        control: &SagaControl,
        definition: &SagaDefinition,
        mut saga: SagaInstance,
    ) -> SagaResult<SagaInstance> {
        let pending: Vec<usize> = saga
            .pending_compensations()
            .into_iter()
            .filter(|index| {
                definition
                    .steps
                    .get(*index)
                    .is_some_and(|step| step.compensation.is_some())
            })
            .collect();

        if pending.is_empty() {
            saga.finish(SagaStatus::Failed);
            if !self.checkpoint(control, &saga).await? {
                return self.aborted(saga.id).await;
            }
            warn!(saga_id = %saga.id, error = saga.error.as_deref().unwrap_or(""), "saga failed");
            return Ok(saga);
        }

        saga.status = SagaStatus::Compensating;
        if !self.checkpoint(control, &saga).await? {
            return self.aborted(saga.id).await;
        }
        info!(saga_id = %saga.id, steps = pending.len(), "compensation started");

        for index in pending {
            let step = &definition.steps[index];
            let Some(compensation) = &step.compensation else {
                continue;
            };
            let timeout = definition
                .timeout_for(index, self.config.default_step_timeout)
                .as_duration();
            let outcome = tokio::time::timeout(
                timeout,
                self.executor.execute_compensation(compensation, &saga.data),
            )
            .await
            .unwrap_or_else(|_| Err(ActionError::Timeout(timeout)));

            match outcome {
                Ok(_) => {
                    saga.compensated_steps.push(index);
                    if !self.checkpoint(control, &saga).await? {
                        return self.aborted(saga.id).await;
                    }
                    debug!(saga_id = %saga.id, step = %step.name, "step compensated");
                }
                Err(error) => {
                    warn!(saga_id = %saga.id, step = %step.name, %error, "compensation failed, continuing");
                }
            }
        }

        saga.finish(SagaStatus::Compensated);
        if !self.checkpoint(control, &saga).await? {
            return self.aborted(saga.id).await;
        }
        info!(saga_id = %saga.id, compensated = ?saga.compensated_steps, "saga compensated");
        Ok(saga)
    }
}
