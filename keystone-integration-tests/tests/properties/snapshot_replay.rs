//! Loading through a snapshot yields the same state as replaying the whole
//! history, whatever the snapshot cadence.

use std::sync::Arc;

use keystone::config::SnapshotFrequency;
use keystone::testing::prelude::*;
use keystone::{CqrsEngine, EventSourcingEngine, EventStore};
use keystone_memory::InMemoryEventStore;
use proptest::prelude::*;

use super::runtime;

/// Positive amounts are increments, negative ones decrements.
fn arb_changes() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(prop_oneof![1i64..50, -50i64..-1], 1..40)
}

proptest! {
    #[test]
    fn snapshot_load_matches_full_replay(
        id in arb_aggregate_id(),
        frequency in 1u64..8,
        changes in arb_changes(),
    ) {
        runtime().block_on(async {
            let store = Arc::new(InMemoryEventStore::new());
            let engine = EventSourcingEngine::new(
                Arc::clone(&store),
                SnapshotFrequency::try_new(frequency).unwrap(),
            );
            let cqrs = CqrsEngine::new();
            register_counter(&cqrs, &engine).unwrap();

            let mut applied = 0u64;
            for change in &changes {
                let command = if *change > 0 {
                    increment(&id, *change)
                } else {
                    decrement(&id, -change)
                };
                // Decrements below zero are rejected and write nothing.
                if cqrs.execute_command(command).await.is_ok() {
                    applied += 1;
                }
            }

            let loaded = engine.load_aggregate::<Counter>(&id).await.unwrap();
            let replayed = engine.rebuild_aggregate::<Counter>(&id).await.unwrap();
            prop_assert_eq!(loaded.state(), replayed.state());
            prop_assert_eq!(loaded.version(), replayed.version());
            prop_assert_eq!(loaded.version().into_inner(), applied);
            prop_assert!(loaded.state().value >= 0);

            let snapshot = store.get_snapshot(&id).await.unwrap();
            if applied >= frequency {
                let snapshot = snapshot.unwrap();
                prop_assert!(snapshot.version.into_inner() <= applied);
                prop_assert_eq!(snapshot.version.into_inner() % frequency, 0);
            } else {
                prop_assert!(snapshot.is_none());
            }
            Ok(())
        })?;
    }
}
