//! When a step fails, exactly the steps that completed are compensated, in
//! reverse order of completion.

use std::sync::Arc;

use keystone::config::SagaConfig;
use keystone::errors::ActionError;
use keystone::saga::{DefaultActionExecutor, SagaAction, SagaDefinitionBuilder};
use keystone::types::{SagaDefinitionId, StepName};
use keystone::{RetryPolicy, SagaOrchestrator, SagaStatus};
use keystone_memory::InMemorySagaRepository;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};

use super::runtime;

type Journal = Arc<Mutex<Vec<String>>>;

fn record(executor: &DefaultActionExecutor, journal: &Journal, name: String, fails: bool) {
    let journal = Arc::clone(journal);
    let label = name.clone();
    executor.register_function(
        name,
        Arc::new(move |_: Value, _: Value| {
            journal.lock().push(label.clone());
            async move {
                if fails {
                    Err(ActionError::Failed("refused".into()))
                } else {
                    Ok(Value::Null)
                }
            }
        }),
    );
}

proptest! {
    #[test]
    fn completed_steps_are_undone_in_reverse(
        steps in 1usize..7,
        failing in 0usize..7,
    ) {
        let failing = failing % steps;
        runtime().block_on(async {
            let executor = Arc::new(DefaultActionExecutor::new());
            let journal = Journal::default();
            let mut builder = SagaDefinitionBuilder::new(
                SagaDefinitionId::try_new("chain").unwrap(),
                "chain",
            )
            .retry_policy(RetryPolicy::no_retry());
            for index in 0..steps {
                record(&executor, &journal, format!("do-{index}"), index == failing);
                record(&executor, &journal, format!("undo-{index}"), false);
                builder = builder
                    .step(
                        StepName::try_new(format!("step-{index}")).unwrap(),
                        SagaAction::function(format!("do-{index}"), json!({})),
                    )
                    .compensate(SagaAction::function(format!("undo-{index}"), json!({})))
                    .then();
            }

            let orchestrator = SagaOrchestrator::new(
                Arc::new(InMemorySagaRepository::new()),
                executor,
                SagaConfig::default(),
            );
            let saga = orchestrator
                .execute_saga(builder.build().unwrap(), json!({}))
                .await
                .unwrap();

            let completed: Vec<usize> = (0..failing).collect();
            let undone: Vec<usize> = completed.iter().rev().copied().collect();
            prop_assert_eq!(&saga.completed_steps, &completed);
            prop_assert_eq!(&saga.failed_steps, &vec![failing]);
            prop_assert_eq!(&saga.compensated_steps, &undone);
            let status = if failing == 0 { SagaStatus::Failed } else { SagaStatus::Compensated };
            prop_assert_eq!(saga.status, status);

            let mut expected: Vec<String> = (0..=failing).map(|i| format!("do-{i}")).collect();
            expected.extend(undone.iter().map(|i| format!("undo-{i}")));
            prop_assert_eq!(journal.lock().clone(), expected);
            Ok(())
        })?;
    }
}
