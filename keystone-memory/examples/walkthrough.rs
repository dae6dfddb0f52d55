//! Runs a coordinator over the in-memory adapters: a few counter commands,
//! a compensated saga, a sharded lookup and a mesh request.
//!
//! ```text
//! RUST_LOG=keystone=debug cargo run -p keystone-memory --example walkthrough
//! ```

use std::sync::Arc;

use futures::future::join_all;
use keystone::config::{CoordinationConfig, TimeoutMs};
use keystone::errors::ActionError;
use keystone::mesh::{HealthProbe, RouteRequest, ServiceDefinition, ServiceTransport};
use keystone::saga::{SagaAction, SagaDefinitionBuilder};
use keystone::sharding::{ShardConnectionFactory, ShardQuery};
use keystone::testing::prelude::*;
use keystone::types::{AggregateId, CommandType, SagaDefinitionId, ServiceId, StepName};
use keystone::{EnterpriseCoordinator, RetryPolicy};
use keystone_memory::{
    InMemoryEventStore, InMemorySagaRepository, InMemoryShardConnectionFactory, InMemoryTransport,
    StaticHealthProbe,
};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let inventory = ServiceId::try_new("inventory")?;
    let mut config = CoordinationConfig::default();
    config.mesh.services = vec![ServiceDefinition::new(
        inventory.clone(),
        "Inventory",
        "inventory.local",
        9000,
    )
    .with_health_endpoint("/health")];
    config.mesh.health_check_interval = TimeoutMs::from_millis(1_000);
    config.mesh.health_check_timeout = TimeoutMs::from_millis(200);

    let coordinator = EnterpriseCoordinator::builder(
        config,
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemorySagaRepository::new()),
    )
    .with_shard_factory(Arc::new(InMemoryShardConnectionFactory::new()) as Arc<dyn ShardConnectionFactory>)
    .with_mesh(
        Arc::new(InMemoryTransport::new()) as Arc<dyn ServiceTransport>,
        Arc::new(StaticHealthProbe::new()) as Arc<dyn HealthProbe>,
    )
    .build()
    .await?;
    register_counter(coordinator.cqrs(), coordinator.event_sourcing())?;
    coordinator.start().await?;

    let seats = AggregateId::try_new("seats")?;
    let outcomes = join_all((1..=5).map(|n| coordinator.execute_command(increment(&seats, n)))).await;
    let conflicts = outcomes.iter().filter(|outcome| outcome.is_err()).count();
    info!(conflicts, "concurrent increments done");
    let value = coordinator.execute_query(counter_value(&seats)).await?;
    info!(%value, "counter after increments");

    coordinator.executor().register_function(
        "charge",
        Arc::new(|_: Value, _: Value| async {
            Err::<Value, _>(ActionError::Failed("card declined".into()))
        }),
    );
    let booking = SagaDefinitionBuilder::new(SagaDefinitionId::try_new("booking")?, "booking")
        .retry_policy(RetryPolicy::no_retry())
        .step(
            StepName::try_new("hold-seat")?,
            SagaAction::Command {
                command_type: CommandType::try_new(INCREMENT)?,
                aggregate_id: seats.clone(),
                payload: json!({"amount": 1}),
            },
        )
        .compensate(SagaAction::Command {
            command_type: CommandType::try_new(DECREMENT)?,
            aggregate_id: seats.clone(),
            payload: json!({"amount": 1}),
        })
        .then()
        .step(StepName::try_new("charge")?, SagaAction::function("charge", json!({})))
        .then()
        .build()?;
    let saga = coordinator.sagas().execute_saga(booking, json!({})).await?;
    info!(status = %saga.status, error = ?saga.error, "booking saga finished");

    let customer = json!({"id": "customer-17"});
    let shard = coordinator.shards()?.get_shard_for_data(&customer, None).await?;
    let row = coordinator
        .shards()?
        .execute_query(&ShardQuery::new("SELECT * FROM customers"), Some(&customer), None)
        .await?;
    info!(%shard, ?row, "sharded lookup");

    let reply = coordinator
        .route_request(RouteRequest::new(inventory, "GET", "/stock/seat"))
        .await?;
    info!(status = reply.status, instance = %reply.instance_id, "inventory answered");

    let metrics = coordinator.metrics().await?;
    info!(
        commands = metrics.cqrs.commands_executed,
        events = metrics.event_sourcing.events_stored,
        compensated = metrics.sagas.compensated,
        "final metrics"
    );
    coordinator.shutdown().await;
    Ok(())
}
