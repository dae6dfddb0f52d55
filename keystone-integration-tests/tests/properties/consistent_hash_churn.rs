//! Adding or removing a shard only moves the keys that have to move.

use keystone::config::VirtualNodes;
use keystone::sharding::ConsistentHashStrategy;
use keystone::types::ShardId;
use proptest::prelude::*;

fn shard(index: usize) -> ShardId {
    ShardId::try_new(format!("shard-{index}")).unwrap()
}

fn ring(count: usize, virtual_nodes: usize) -> ConsistentHashStrategy {
    ConsistentHashStrategy::new(
        (0..count).map(shard),
        VirtualNodes::try_new(virtual_nodes).unwrap(),
    )
}

fn keys() -> impl Strategy<Value = Vec<String>> {
    prop::collection::hash_set("[a-z0-9]{1,16}", 1..200)
        .prop_map(|keys| keys.into_iter().collect())
}

proptest! {
    #[test]
    fn adding_a_shard_only_moves_keys_onto_it(
        keys in keys(),
        count in 1usize..6,
        virtual_nodes in 1usize..200,
    ) {
        let strategy = ring(count, virtual_nodes);
        let before: Vec<ShardId> = keys.iter().map(|k| strategy.place(k).unwrap()).collect();

        let added = shard(count);
        strategy.add_shard(&added);
        for (key, previous) in keys.iter().zip(&before) {
            let now = strategy.place(key).unwrap();
            prop_assert!(now == *previous || now == added, "{} moved from {} to {}", key, previous, now);
        }
    }

    #[test]
    fn removing_a_shard_only_moves_its_own_keys(
        keys in keys(),
        count in 2usize..6,
        virtual_nodes in 1usize..200,
        removed in 0usize..6,
    ) {
        let strategy = ring(count, virtual_nodes);
        let removed = shard(removed % count);
        let before: Vec<ShardId> = keys.iter().map(|k| strategy.place(k).unwrap()).collect();

        strategy.remove_shard(&removed);
        for (key, previous) in keys.iter().zip(&before) {
            let now = strategy.place(key).unwrap();
            prop_assert_ne!(&now, &removed);
            if *previous != removed {
                prop_assert_eq!(&now, previous);
            }
        }
    }

    #[test]
    fn placement_is_stable_across_instances(
        keys in keys(),
        count in 1usize..6,
    ) {
        let first = ring(count, 150);
        let second = ring(count, 150);
        for key in &keys {
            prop_assert_eq!(first.place(key).unwrap(), second.place(key).unwrap());
        }
    }
}
