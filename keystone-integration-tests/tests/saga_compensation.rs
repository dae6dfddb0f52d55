//! End-to-end saga scenarios through the in-memory saga repository.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use keystone::config::{BackoffMultiplier, DelayMs, MaxAttempts, SagaConfig, TimeoutMs};
use keystone::errors::{ActionError, SagaError};
use keystone::saga::{
    ActionExecutor, DefaultActionExecutor, SagaAction, SagaDefinition, SagaDefinitionBuilder,
    SagaRepository,
};
use keystone::types::{SagaDefinitionId, SagaId, StepName};
use keystone::{RetryPolicy, SagaOrchestrator, SagaStatus};
use keystone_memory::InMemorySagaRepository;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_test::assert_ok;

fn quick_retries(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        MaxAttempts::try_new(attempts).unwrap(),
        DelayMs::new(1),
        BackoffMultiplier::try_new(1.0).unwrap(),
        DelayMs::new(5),
    )
}

fn step(name: &str) -> StepName {
    StepName::try_new(name).unwrap()
}

struct Shop {
    executor: Arc<DefaultActionExecutor>,
    log: Arc<Mutex<Vec<String>>>,
    payment_attempts: Arc<AtomicU32>,
}

impl Shop {
    /// `reserve` and `ship` succeed; `charge` always fails.
    fn new() -> Self {
        let shop = Self {
            executor: Arc::new(DefaultActionExecutor::new()),
            log: Arc::new(Mutex::new(Vec::new())),
            payment_attempts: Arc::new(AtomicU32::new(0)),
        };
        for name in ["reserve", "release", "ship", "recall", "refund"] {
            shop.succeed(name);
        }
        let attempts = Arc::clone(&shop.payment_attempts);
        let log = Arc::clone(&shop.log);
        shop.executor.register_function(
            "charge",
            Arc::new(move |_: Value, _: Value| {
                attempts.fetch_add(1, Ordering::SeqCst);
                log.lock().push("charge".to_string());
                async { Err::<Value, _>(ActionError::Failed("card declined".into())) }
            }),
        );
        shop
    }

    fn succeed(&self, name: &str) {
        let log = Arc::clone(&self.log);
        let label = name.to_string();
        self.executor.register_function(
            name,
            Arc::new(move |data: Value, _: Value| {
                log.lock().push(label.clone());
                async move { Ok::<_, ActionError>(json!({ "echo": data })) }
            }),
        );
    }

    fn definition(&self) -> SagaDefinition {
        SagaDefinitionBuilder::new(SagaDefinitionId::try_new("checkout").unwrap(), "checkout")
            .description("reserve stock, take payment, ship")
            .step(step("reserve"), SagaAction::function("reserve", json!({"sku": "A-1"})))
            .compensate(SagaAction::function("release", json!({"sku": "A-1"})))
            .then()
            .step(step("charge"), SagaAction::function("charge", json!({"amount": 42})))
            .retry_policy(quick_retries(3))
            .compensate(SagaAction::function("refund", json!({"amount": 42})))
            .then()
            .step(step("ship"), SagaAction::function("ship", json!({})))
            .compensate(SagaAction::function("recall", json!({})))
            .then()
            .timeout(TimeoutMs::from_millis(1_000))
            .build()
            .unwrap()
    }

    fn orchestrator(
        &self,
        repository: &Arc<InMemorySagaRepository>,
    ) -> SagaOrchestrator<InMemorySagaRepository> {
        SagaOrchestrator::new(
            Arc::clone(repository),
            Arc::clone(&self.executor) as Arc<dyn ActionExecutor>,
            SagaConfig::default(),
        )
    }
}

#[tokio::test]
async fn failing_middle_step_compensates_only_the_first() {
    let shop = Shop::new();
    let repository = Arc::new(InMemorySagaRepository::new());
    let orchestrator = shop.orchestrator(&repository);

    let saga = orchestrator
        .execute_saga(shop.definition(), json!({"order": 7}))
        .await
        .unwrap();

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.completed_steps, vec![0]);
    assert_eq!(saga.failed_steps, vec![1]);
    assert_eq!(saga.compensated_steps, vec![0]);
    assert!(saga.ended_at.is_some());
    assert!(saga.error.as_deref().unwrap().contains("card declined"));
    assert_eq!(shop.payment_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        *shop.log.lock(),
        ["reserve", "charge", "charge", "charge", "release"]
    );

    let stored = repository.find_by_id(&saga.id).await.unwrap().unwrap();
    assert_eq!(stored, saga);
    assert_eq!(
        orchestrator.get_saga_status(&saga.id).await.unwrap(),
        Some(SagaStatus::Compensated)
    );
    assert_eq!(
        orchestrator.get_saga_status(&SagaId::generate()).await.unwrap(),
        None
    );
    let counts = orchestrator.status_counts().await.unwrap();
    assert_eq!(counts.compensated, 1);
    assert_eq!(counts.total(), 1);
}

#[tokio::test]
async fn background_saga_reaches_the_same_outcome() {
    let shop = Shop::new();
    let repository = Arc::new(InMemorySagaRepository::new());
    let orchestrator = shop.orchestrator(&repository);

    let pending = orchestrator
        .start_saga(shop.definition(), json!({"order": 8}))
        .await
        .unwrap();
    assert_eq!(pending.status, SagaStatus::Pending);

    let finished = orchestrator.wait(&pending.id).await.unwrap();
    assert_eq!(finished.status, SagaStatus::Compensated);
    assert_eq!(finished.compensated_steps, vec![0]);
}

#[tokio::test]
async fn successful_saga_completes_every_step() {
    let shop = Shop::new();
    shop.succeed("charge");
    let repository = Arc::new(InMemorySagaRepository::new());
    let orchestrator = shop.orchestrator(&repository);

    let saga = orchestrator
        .execute_saga(shop.definition(), json!({}))
        .await
        .unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.completed_steps, vec![0, 1, 2]);
    assert!(saga.compensated_steps.is_empty());
    assert_eq!(*shop.log.lock(), ["reserve", "charge", "ship"]);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn failed_compensation_is_logged_and_the_unwind_finishes() {
    let shop = Shop::new();
    shop.executor.register_function(
        "release",
        Arc::new(|_: Value, _: Value| async {
            Err::<Value, _>(ActionError::Failed("warehouse offline".into()))
        }),
    );
    let repository = Arc::new(InMemorySagaRepository::new());

    let saga = assert_ok!(
        shop.orchestrator(&repository)
            .execute_saga(shop.definition(), json!({}))
            .await
    );
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert!(saga.compensated_steps.is_empty());
    assert!(logs_contain("step failed"));
    assert!(logs_contain("compensation failed, continuing"));
    assert!(logs_contain("warehouse offline"));
}

#[tokio::test]
async fn hanging_step_times_out_and_compensates() {
    let shop = Shop::new();
    shop.executor.register_function(
        "charge",
        Arc::new(|_: Value, _: Value| async {
            std::future::pending::<()>().await;
            Ok::<_, ActionError>(Value::Null)
        }),
    );
    let definition = SagaDefinitionBuilder::new(SagaDefinitionId::try_new("slow").unwrap(), "slow")
        .retry_policy(RetryPolicy::no_retry())
        .step(step("reserve"), SagaAction::function("reserve", json!({})))
        .compensate(SagaAction::function("release", json!({})))
        .then()
        .step(step("charge"), SagaAction::function("charge", json!({})))
        .timeout(TimeoutMs::from_millis(20))
        .then()
        .build()
        .unwrap();
    let repository = Arc::new(InMemorySagaRepository::new());

    let saga = shop
        .orchestrator(&repository)
        .execute_saga(definition, json!({}))
        .await
        .unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert!(saga.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(saga.compensated_steps, vec![0]);
}

#[tokio::test]
async fn disabled_orchestrator_refuses_to_start() {
    let shop = Shop::new();
    let orchestrator = SagaOrchestrator::new(
        Arc::new(InMemorySagaRepository::new()),
        Arc::clone(&shop.executor) as Arc<dyn ActionExecutor>,
        SagaConfig {
            enabled: false,
            ..SagaConfig::default()
        },
    );
    let error = orchestrator
        .execute_saga(shop.definition(), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, SagaError::Disabled));
}

#[tokio::test]
async fn recover_resumes_interrupted_instances() {
    let shop = Shop::new();
    shop.succeed("charge");
    let repository = Arc::new(InMemorySagaRepository::new());
    let orchestrator = shop.orchestrator(&repository);
    let definition = orchestrator.register_definition(shop.definition()).unwrap();

    // A crash after the first step left the instance running.
    let mut interrupted = keystone::SagaInstance::new(definition.id.clone(), json!({}));
    interrupted.status = SagaStatus::Running;
    interrupted.completed_steps.push(0);
    interrupted.current_step = 1;
    repository.save(&interrupted).await.unwrap();

    let resumed = orchestrator.recover().await.unwrap();
    assert_eq!(resumed, vec![interrupted.id]);

    let finished = orchestrator.wait(&interrupted.id).await.unwrap();
    assert_eq!(finished.status, SagaStatus::Completed);
    assert_eq!(finished.completed_steps, vec![0, 1, 2]);
    assert_eq!(*shop.log.lock(), ["charge", "ship"]);
}
