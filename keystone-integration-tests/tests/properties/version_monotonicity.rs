//! Aggregate versions start at 1 and grow by exactly one per event, no
//! matter how the events are batched into commands.

use std::sync::Arc;

use keystone::config::SnapshotFrequency;
use keystone::testing::prelude::*;
use keystone::{CqrsEngine, EventSourcingEngine, EventStore};
use keystone_memory::InMemoryEventStore;
use proptest::prelude::*;

use super::runtime;

proptest! {
    #[test]
    fn versions_are_gapless_per_aggregate(
        id in arb_aggregate_id(),
        amounts in prop::collection::vec(1i64..1_000, 1..25),
    ) {
        runtime().block_on(async {
            let store = Arc::new(InMemoryEventStore::new());
            let engine = EventSourcingEngine::new(
                Arc::clone(&store),
                SnapshotFrequency::try_new(1_000).unwrap(),
            );
            let cqrs = CqrsEngine::new();
            register_counter(&cqrs, &engine).unwrap();

            for amount in &amounts {
                let outcome = cqrs.execute_command(increment(&id, *amount)).await.unwrap();
                prop_assert_eq!(outcome.events.len(), 1);
            }

            let events = store.get_events(&id, None).await.unwrap();
            let versions: Vec<u64> = events.iter().map(|e| e.version.into_inner()).collect();
            let expected: Vec<u64> = (1..=u64::try_from(versions.len()).unwrap()).collect();
            prop_assert_eq!(versions, expected);

            let root = engine.load_aggregate::<Counter>(&id).await.unwrap();
            prop_assert_eq!(root.version().into_inner(), u64::try_from(amounts.len()).unwrap());
            prop_assert_eq!(root.state().value, amounts.iter().sum::<i64>());
            Ok(())
        })?;
    }

    #[test]
    fn stale_writers_never_advance_the_stream(
        id in arb_aggregate_id(),
        prefix in 1usize..10,
    ) {
        runtime().block_on(async {
            let store = InMemoryEventStore::new();
            let history = EventBuilder::new()
                .aggregate_id(id.as_ref())
                .event_type(INCREMENTED)
                .payload(serde_json::json!({"amount": 1}))
                .build_sequence(prefix);
            store
                .save_events(&id, history, keystone::EventVersion::initial())
                .await
                .unwrap();

            let stale = EventBuilder::new()
                .aggregate_id(id.as_ref())
                .event_type(INCREMENTED)
                .version(1)
                .build();
            let result = store
                .save_events(&id, vec![stale], keystone::EventVersion::initial())
                .await;
            prop_assert!(result.is_err());
            prop_assert_eq!(store.get_events(&id, None).await.unwrap().len(), prefix);
            Ok(())
        })?;
    }
}
