//! Rebuilding a projection from history reproduces the live read model, and
//! rebuilding it again changes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use keystone::config::SnapshotFrequency;
use keystone::cqrs::EventHandler;
use keystone::testing::prelude::*;
use keystone::types::{AggregateId, ProjectionName};
use keystone::{CqrsEngine, EventSourcingEngine, ProjectionManager};
use keystone_memory::InMemoryEventStore;
use proptest::prelude::*;
use serde_json::Value;

use super::runtime;

fn counters() -> Vec<AggregateId> {
    ["counter-a", "counter-b", "counter-c"]
        .iter()
        .map(|id| AggregateId::try_new(*id).unwrap())
        .collect()
}

proptest! {
    #[test]
    fn rebuild_reproduces_the_live_projection(
        increments in prop::collection::vec((0usize..3, 1i64..100), 1..30),
    ) {
        runtime().block_on(async {
            let store = Arc::new(InMemoryEventStore::new());
            let engine = EventSourcingEngine::new(store, SnapshotFrequency::try_new(5).unwrap());
            let cqrs = CqrsEngine::new();
            register_counter(&cqrs, &engine).unwrap();
            let projections = Arc::new(ProjectionManager::new(engine.clone()));
            projections
                .register_projection(Arc::new(CounterTotals::default()))
                .unwrap();
            cqrs.event_bus()
                .subscribe_all(Arc::clone(&projections) as Arc<dyn EventHandler>);

            let ids = counters();
            let mut expected: BTreeMap<String, i64> = BTreeMap::new();
            for (index, amount) in &increments {
                let id = &ids[*index];
                cqrs.execute_command(increment(id, *amount)).await.unwrap();
                *expected.entry(id.to_string()).or_default() += amount;
            }

            let name = ProjectionName::try_new(COUNTER_TOTALS).unwrap();
            let live = projections.get_projection(&name).unwrap();
            let expected = serde_json::to_value(&expected).unwrap();
            prop_assert_eq!(&live, &expected);

            let first = projections.rebuild_projection(&name, None).await.unwrap();
            let second = projections.rebuild_projection(&name, None).await.unwrap();
            prop_assert_eq!(&first.data, &live);
            prop_assert_eq!(&second.data, &first.data);
            prop_assert_eq!(second.last_processed_event_id, first.last_processed_event_id);
            prop_assert_eq!(projections.get_projection(&name), Some::<Value>(live));
            Ok(())
        })?;
    }
}
