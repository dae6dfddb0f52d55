//! The enterprise coordinator assembled over the in-memory adapters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keystone::config::{
    AlertThresholds, CoordinationConfig, FailureThreshold, MonitoringConfig, Ratio, TimeoutMs,
};
use keystone::errors::{ActionError, MeshError, SagaError, ShardError};
use keystone::mesh::{
    CircuitBreakerConfig, HealthProbe, RouteRequest, ServiceDefinition, ServiceTransport,
};
use keystone::saga::{SagaAction, SagaDefinitionBuilder, SagaRepository};
use keystone::sharding::{ShardConnectionFactory, ShardQuery, ShardResponse};
use keystone::testing::prelude::*;
use keystone::types::{AggregateId, CommandType, ProjectionName, SagaDefinitionId, ServiceId, StepName};
use keystone::metadata::ActorId;
use keystone::{
    Alert, CoordinationError, EnterpriseCoordinator, ErrorKind, EventFilter, EventStore,
    EventVersion, RetryPolicy, SagaInstance, SagaStatus, Timestamp,
};
use keystone_memory::{
    InMemoryEventStore, InMemorySagaRepository, InMemoryShardConnectionFactory, InMemoryTransport,
    StaticHealthProbe, TransportBehaviour,
};
use serde_json::{json, Value};

type Coordinator = EnterpriseCoordinator<InMemoryEventStore, InMemorySagaRepository>;

struct Adapters {
    store: Arc<InMemoryEventStore>,
    sagas: Arc<InMemorySagaRepository>,
    shards: Arc<InMemoryShardConnectionFactory>,
    transport: Arc<InMemoryTransport>,
    probe: Arc<StaticHealthProbe>,
}

impl Adapters {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryEventStore::new()),
            sagas: Arc::new(InMemorySagaRepository::new()),
            shards: Arc::new(InMemoryShardConnectionFactory::new()),
            transport: Arc::new(InMemoryTransport::new()),
            probe: Arc::new(StaticHealthProbe::new()),
        }
    }

    async fn build(&self, config: CoordinationConfig) -> Result<Coordinator, CoordinationError> {
        EnterpriseCoordinator::builder(config, Arc::clone(&self.store), Arc::clone(&self.sagas))
            .with_shard_factory(Arc::clone(&self.shards) as Arc<dyn ShardConnectionFactory>)
            .with_mesh(
                Arc::clone(&self.transport) as Arc<dyn ServiceTransport>,
                Arc::clone(&self.probe) as Arc<dyn HealthProbe>,
            )
            .build()
            .await
    }
}

fn inventory_id() -> ServiceId {
    ServiceId::try_new("inventory").unwrap()
}

fn full_config() -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.mesh.services = vec![ServiceDefinition::new(
        inventory_id(),
        "Inventory",
        "inventory.local",
        9000,
    )
    .with_health_endpoint("/health")];
    config.mesh.health_check_interval = TimeoutMs::from_millis(10);
    config.mesh.health_check_timeout = TimeoutMs::from_millis(5);
    config.monitoring.metrics_interval = TimeoutMs::from_millis(10);
    config
}

fn counters(coordinator: &Coordinator) {
    register_counter(coordinator.cqrs(), coordinator.event_sourcing()).unwrap();
    coordinator
        .projections()
        .register_projection(Arc::new(CounterTotals::default()))
        .unwrap();
}

fn counter(id: &str) -> AggregateId {
    AggregateId::try_new(id).unwrap()
}

#[tokio::test]
async fn commands_queries_projections_and_audit_flow_together() {
    let adapters = Adapters::new();
    let coordinator = adapters.build(full_config()).await.unwrap();
    counters(&coordinator);
    let id = counter("widgets");

    coordinator.execute_command(increment(&id, 10)).await.unwrap();
    coordinator.execute_command(decrement(&id, 3)).await.unwrap();

    let value = coordinator.execute_query(counter_value(&id)).await.unwrap();
    assert_eq!(value, json!({"value": 7, "version": 2}));

    let totals = coordinator
        .projections()
        .get_projection(&ProjectionName::try_new(COUNTER_TOTALS).unwrap())
        .unwrap();
    assert_eq!(totals, json!({"widgets": 7}));

    let trail = coordinator.audit().get_audit_trail(&id).await.unwrap();
    assert_eq!(trail.events.len(), 2);
    assert_eq!(trail.version.into_inner(), 2);
    let report = coordinator
        .audit()
        .generate_audit_report(&EventFilter::all())
        .await
        .unwrap();
    assert_eq!(report.total_events, 2);
    assert_eq!(report.event_types.get(INCREMENTED), Some(&1));
    assert_eq!(report.event_types.get(DECREMENTED), Some(&1));

    let error = coordinator
        .execute_command(decrement(&id, 100))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);

    let metrics = coordinator.metrics().await.unwrap();
    assert_eq!(metrics.cqrs.commands_executed, 3);
    assert_eq!(metrics.cqrs.command_failures, 1);
    assert_eq!(metrics.cqrs.queries_executed, 1);
    assert_eq!(metrics.event_sourcing.events_stored, 2);
}

#[tokio::test]
async fn history_is_attributed_and_replayable() {
    let adapters = Adapters::new();
    let coordinator = adapters.build(full_config()).await.unwrap();
    counters(&coordinator);
    let alice = ActorId::try_new("alice").unwrap();
    let bolts = counter("bolts");
    let nuts = counter("nuts");
    assert!(!coordinator.event_sourcing().aggregate_exists(&bolts).await.unwrap());

    coordinator
        .execute_command(increment(&bolts, 4).with_actor(alice.clone()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let later = Timestamp::now();
    tokio::time::sleep(Duration::from_millis(5)).await;
    coordinator
        .execute_command(increment(&bolts, 1).with_actor(alice.clone()))
        .await
        .unwrap();
    coordinator.execute_command(increment(&nuts, 2)).await.unwrap();

    let engine = coordinator.event_sourcing();
    assert!(engine.aggregate_exists(&bolts).await.unwrap());
    assert_eq!(engine.replay_events(&bolts, None).await.unwrap().len(), 2);
    let tail = engine
        .replay_events(&bolts, Some(EventVersion::new(1)))
        .await
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].payload, json!({"amount": 1}));

    let audit = coordinator.audit();
    assert_eq!(audit.get_user_activity(&alice, None).await.unwrap().len(), 2);
    let recent = audit.get_user_activity(&alice, Some(later)).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].version, EventVersion::new(2));

    let nut_events = audit
        .get_system_activity(&EventFilter {
            aggregate_ids: Some(vec![nuts.clone()]),
            ..EventFilter::all()
        })
        .await
        .unwrap();
    assert_eq!(nut_events.len(), 1);
    assert!(nut_events[0].metadata.actor_id.is_none());

    let projections = coordinator.projections().get_all_projections();
    let totals = &projections[&ProjectionName::try_new(COUNTER_TOTALS).unwrap()];
    assert_eq!(totals.data, json!({"bolts": 5, "nuts": 2}));
    assert!(totals.last_processed_event_id.is_some());
}

#[tokio::test]
async fn sharded_queries_and_mesh_requests_go_through_the_adapters() {
    let adapters = Adapters::new();
    let coordinator = adapters.build(full_config()).await.unwrap();
    let shards = coordinator.shards().unwrap();
    assert_eq!(shards.shard_ids().len(), 3);

    let data = json!({"id": "user-42"});
    let owner = shards.get_shard_for_data(&data, None).await.unwrap();
    let response = shards
        .execute_query(&ShardQuery::new("SELECT * FROM users"), Some(&data), None)
        .await
        .unwrap();
    match response {
        ShardResponse::Single { shard_id, value } => {
            assert_eq!(shard_id, owner);
            assert_eq!(value["shard"], owner.as_ref());
        }
        ShardResponse::Broadcast(_) => panic!("a keyed query must hit one shard"),
    }

    let broadcast = shards.execute_on_all_shards(&ShardQuery::ping()).await;
    assert!(broadcast.is_complete());
    assert_eq!(broadcast.results.len(), 3);

    let reply = coordinator
        .route_request(RouteRequest::new(inventory_id(), "GET", "/stock/A-1"))
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["path"], "/stock/A-1");

    let metrics = coordinator.metrics().await.unwrap();
    let sharding = metrics.sharding.unwrap();
    assert_eq!(sharding.total_shards, 3);
    assert!(sharding.total_queries >= 2);
    assert_eq!(sharding.failed_queries, 0);
    let mesh = metrics.mesh.unwrap();
    assert_eq!(mesh.total_requests, 1);
    assert_eq!(mesh.successful_requests, 1);
    assert_eq!(mesh.total_services, 1);
}

#[tokio::test]
async fn saga_commands_are_compensated_through_the_engine() {
    let adapters = Adapters::new();
    let coordinator = adapters.build(full_config()).await.unwrap();
    counters(&coordinator);
    let id = counter("reserved-seats");

    let definition = SagaDefinitionBuilder::new(SagaDefinitionId::try_new("booking").unwrap(), "booking")
        .retry_policy(RetryPolicy::no_retry())
        .step(
            StepName::try_new("reserve").unwrap(),
            SagaAction::Command {
                command_type: CommandType::try_new(INCREMENT).unwrap(),
                aggregate_id: id.clone(),
                payload: json!({"amount": 2}),
            },
        )
        .compensate(SagaAction::Command {
            command_type: CommandType::try_new(DECREMENT).unwrap(),
            aggregate_id: id.clone(),
            payload: json!({"amount": 2}),
        })
        .then()
        .step(
            StepName::try_new("notify").unwrap(),
            SagaAction::Service {
                service_id: inventory_id(),
                method: "POST".into(),
                path: "/notify".into(),
                body: Some(json!({"seats": 2})),
            },
        )
        .then()
        .build()
        .unwrap();
    adapters.transport.set_service_behaviour(
        inventory_id(),
        TransportBehaviour::Fail("inventory unreachable".into()),
    );

    let saga = coordinator
        .sagas()
        .execute_saga(definition, json!({}))
        .await
        .unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.compensated_steps, vec![0]);

    let value = coordinator.execute_query(counter_value(&id)).await.unwrap();
    assert_eq!(value, json!({"value": 0, "version": 2}));

    let metrics = coordinator.metrics().await.unwrap();
    assert_eq!(metrics.sagas.compensated, 1);
    assert_eq!(metrics.sagas.total(), 1);
}

#[tokio::test]
async fn start_recovers_sagas_and_shutdown_stops_everything() {
    let adapters = Adapters::new();
    let coordinator = adapters.build(full_config()).await.unwrap();
    coordinator.executor().register_function(
        "stamp",
        Arc::new(|data: Value, _: Value| async move { Ok::<_, ActionError>(data) }),
    );
    let definition = SagaDefinitionBuilder::new(SagaDefinitionId::try_new("stamping").unwrap(), "stamping")
        .step(
            StepName::try_new("stamp").unwrap(),
            SagaAction::function("stamp", json!({"ok": true})),
        )
        .then()
        .build()
        .unwrap();
    coordinator.sagas().register_definition(definition.clone()).unwrap();

    let pending = SagaInstance::new(definition.id.clone(), json!({}));
    adapters.sagas.save(&pending).await.unwrap();

    let resumed = coordinator.start().await.unwrap();
    assert_eq!(resumed, vec![pending.id]);
    let finished = coordinator.sagas().wait(&pending.id).await.unwrap();
    assert_eq!(finished.status, SagaStatus::Completed);

    assert!(coordinator.is_monitoring());
    assert!(coordinator.registry().unwrap().is_health_checking());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(adapters.probe.probes() >= 1);

    let shard_ids = coordinator.shards().unwrap().shard_ids();
    assert_eq!(shard_ids.len(), 3);
    coordinator.shutdown().await;
    assert!(!coordinator.is_monitoring());
    assert!(!coordinator.registry().unwrap().is_health_checking());
    for shard_id in &shard_ids {
        assert!(adapters.shards.connection(shard_id).unwrap().is_closed());
    }
}

#[tokio::test]
async fn shutdown_leaves_in_flight_sagas_resumable() {
    let adapters = Adapters::new();
    let coordinator = adapters.build(full_config()).await.unwrap();
    let settled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&settled);
    coordinator.executor().register_function(
        "settle",
        Arc::new(move |data: Value, _: Value| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, ActionError>(data)
            }
        }),
    );
    let definition = SagaDefinitionBuilder::new(SagaDefinitionId::try_new("settlement").unwrap(), "settlement")
        .step(
            StepName::try_new("settle").unwrap(),
            SagaAction::function("settle", json!({})),
        )
        .then()
        .build()
        .unwrap();

    let saga = coordinator
        .sagas()
        .start_saga(definition, json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    coordinator.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!settled.load(Ordering::SeqCst));
    let status = coordinator.sagas().get_saga_status(&saga.id).await.unwrap();
    assert!(matches!(status, Some(SagaStatus::Pending | SagaStatus::Running)));

    let resumed = coordinator.sagas().recover().await.unwrap();
    assert_eq!(resumed, vec![saga.id]);
    let finished = coordinator.sagas().wait(&saga.id).await.unwrap();
    assert_eq!(finished.status, SagaStatus::Completed);
    assert!(settled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn enabled_subsystems_require_their_adapters() {
    let store = Arc::new(InMemoryEventStore::new());
    let sagas = Arc::new(InMemorySagaRepository::new());

    let error = EnterpriseCoordinator::builder(
        CoordinationConfig::default(),
        Arc::clone(&store),
        Arc::clone(&sagas),
    )
    .build()
    .await
    .unwrap_err();
    assert!(matches!(error, CoordinationError::Validation(_)));

    let mut config = CoordinationConfig::default();
    config.sharding.enabled = false;
    let error = EnterpriseCoordinator::builder(config, store, sagas)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::Validation(_)));
    assert_eq!(error.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn minimal_configuration_leaves_optional_subsystems_out() {
    let coordinator = EnterpriseCoordinator::builder(
        CoordinationConfig::minimal(),
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemorySagaRepository::new()),
    )
    .build()
    .await
    .unwrap();
    counters(&coordinator);

    let id = counter("solo");
    coordinator.execute_command(increment(&id, 1)).await.unwrap();
    // Projections are not subscribed in the minimal setup.
    let totals = coordinator
        .projections()
        .get_projection(&ProjectionName::try_new(COUNTER_TOTALS).unwrap());
    assert!(totals.map_or(true, |data| data.get("solo").is_none()));

    assert!(matches!(coordinator.shards(), Err(ShardError::Disabled)));
    assert!(matches!(coordinator.gateway(), Err(MeshError::Disabled)));
    assert!(coordinator.start().await.unwrap().is_empty());
    assert!(!coordinator.is_monitoring());
    assert!(coordinator.check_alerts().is_empty());

    let metrics = coordinator.metrics().await.unwrap();
    assert!(metrics.sharding.is_none());
    assert!(metrics.mesh.is_none());

    let definition = SagaDefinitionBuilder::new(SagaDefinitionId::try_new("off").unwrap(), "off")
        .step(StepName::try_new("noop").unwrap(), SagaAction::function("noop", json!({})))
        .then()
        .build()
        .unwrap();
    let error = coordinator
        .sagas()
        .execute_saga(definition, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, SagaError::Disabled));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn failing_services_raise_alerts() {
    let adapters = Adapters::new();
    let mut config = full_config();
    config.sharding.enabled = false;
    config.mesh.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: FailureThreshold::try_new(2).unwrap(),
        ..CircuitBreakerConfig::default()
    };
    config.monitoring = MonitoringConfig {
        enabled: true,
        metrics_interval: TimeoutMs::from_millis(10),
        alert_thresholds: AlertThresholds {
            error_rate: Ratio::try_new(0.5).unwrap(),
            response_time: TimeoutMs::from_millis(60_000),
            circuit_breaker_trips: 1,
        },
    };
    let coordinator = adapters.build(config).await.unwrap();
    assert!(coordinator.check_alerts().is_empty());

    coordinator
        .route_request(RouteRequest::new(inventory_id(), "GET", "/stock"))
        .await
        .unwrap();
    assert!(coordinator.check_alerts().is_empty());

    adapters.transport.set_service_behaviour(
        inventory_id(),
        TransportBehaviour::Fail("connection reset".into()),
    );
    for _ in 0..3 {
        let outcome = coordinator
            .route_request(RouteRequest::new(inventory_id(), "GET", "/stock"))
            .await;
        assert!(outcome.is_err());
    }

    let alerts = coordinator.check_alerts();
    assert!(alerts
        .iter()
        .any(|alert| matches!(alert, Alert::ErrorRate { observed, .. } if *observed > 0.5)));
    assert!(alerts
        .iter()
        .any(|alert| matches!(alert, Alert::CircuitBreakerTrips { observed: 1, threshold: 1 })));
    assert!(!alerts
        .iter()
        .any(|alert| matches!(alert, Alert::ResponseTime { .. })));

    coordinator.start().await.unwrap();
    assert!(coordinator.is_monitoring());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn configuration_documents_drive_the_build() {
    let config = CoordinationConfig::from_json_str(
        r#"{
            "event_sourcing": { "snapshot_frequency": 2 },
            "saga": { "enabled": false },
            "sharding": { "enabled": false },
            "mesh": { "enabled": false },
            "monitoring": { "enabled": false }
        }"#,
    )
    .unwrap();
    let store = Arc::new(InMemoryEventStore::new());
    let coordinator = EnterpriseCoordinator::builder(
        config,
        Arc::clone(&store),
        Arc::new(InMemorySagaRepository::new()),
    )
    .build()
    .await
    .unwrap();
    counters(&coordinator);

    let id = counter("documented");
    for _ in 0..4 {
        coordinator.execute_command(increment(&id, 1)).await.unwrap();
    }
    assert_eq!(store.snapshot_count(), 1);
    let snapshot = store.get_snapshot(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.version.into_inner(), 4);
}
