//! Property tests over the pure building blocks of the core crate: retry
//! backoff, shard placement strategies and configuration parsing.
//!
//! Behaviour that needs an event store, a saga repository or a transport is
//! covered by `keystone-integration-tests` against the in-memory adapters.

use keystone::config::{BackoffMultiplier, CoordinationConfig, DelayMs, MaxAttempts};
use keystone::sharding::{HashStrategy, RangeStrategy, ShardRange, ShardingStrategy};
use keystone::types::ShardId;
use keystone::RetryPolicy;
use proptest::prelude::*;
use serde_json::json;

fn shard(index: usize) -> ShardId {
    ShardId::try_new(format!("shard-{index}")).unwrap()
}

fn arb_policy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..=10, 0u64..5_000, 1.0f64..=10.0, 0u64..60_000).prop_map(
        |(attempts, initial, multiplier, max)| {
            RetryPolicy::new(
                MaxAttempts::try_new(attempts).unwrap(),
                DelayMs::new(initial),
                BackoffMultiplier::try_new(multiplier).unwrap(),
                DelayMs::new(max.max(initial)),
            )
        },
    )
}

#[test]
fn test_default_policy_doubles_until_capped() {
    let policy = RetryPolicy::default();
    let delays: Vec<u128> = (1..=6)
        .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
        .collect();
    assert_eq!(delays, [1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
}

proptest! {
    #[test]
    fn test_backoff_never_shrinks_and_respects_the_cap(policy in arb_policy(), attempt in 1u32..64) {
        let current = policy.delay_for_attempt(attempt);
        let next = policy.delay_for_attempt(attempt + 1);
        prop_assert!(next >= current);
        prop_assert!(next <= policy.max_delay.as_duration());
    }

    #[test]
    fn test_first_delay_is_the_initial_delay(policy in arb_policy()) {
        let first = policy.delay_for_attempt(1);
        let initial = policy.initial_delay.as_duration();
        let drift = first.max(initial) - first.min(initial);
        prop_assert!(drift <= std::time::Duration::from_millis(1));
    }

    #[test]
    fn test_hash_placement_stays_inside_the_shard_set(
        shard_count in 1usize..12,
        keys in prop::collection::vec("[a-z0-9-]{1,24}", 1..64),
    ) {
        let shards: Vec<ShardId> = (0..shard_count).map(shard).collect();
        let strategy = HashStrategy::new(shards.clone());
        let again = HashStrategy::new(shards.iter().rev().cloned());
        for key in &keys {
            let owner = strategy.place(key).unwrap();
            prop_assert!(shards.contains(&owner));
            prop_assert_eq!(owner, again.place(key).unwrap());
        }
    }

    #[test]
    fn test_range_placement_follows_the_table(value in -1_000.0f64..3_000.0) {
        let strategy = RangeStrategy::new(
            vec![
                ShardRange::new(0.0, 1_000.0, shard(0)),
                ShardRange::new(1_000.0, 2_000.0, shard(1)),
            ],
            |data| data.get("amount").and_then(serde_json::Value::as_f64),
        );
        let key = strategy.shard_key(&json!({ "amount": value })).unwrap();
        let placed = tokio_test::block_on(strategy.shard_id(&key));

        if (0.0..1_000.0).contains(&value) {
            prop_assert_eq!(placed.unwrap(), shard(0));
        } else if (1_000.0..2_000.0).contains(&value) {
            prop_assert_eq!(placed.unwrap(), shard(1));
        } else {
            prop_assert!(placed.is_err());
        }
    }

    #[test]
    fn test_out_of_range_attempts_are_rejected(attempts in prop_oneof![Just(0u32), 101u32..1_000]) {
        let document = json!({ "saga": { "retry_policy": { "max_attempts": attempts } } });
        prop_assert!(CoordinationConfig::from_json_str(&document.to_string()).is_err());
    }

    #[test]
    fn test_in_range_snapshot_frequencies_parse(frequency in 1u64..10_000) {
        let document = json!({ "event_sourcing": { "snapshot_frequency": frequency } });
        let config = CoordinationConfig::from_json_str(&document.to_string()).unwrap();
        prop_assert_eq!(config.event_sourcing.snapshot_frequency.into_inner(), frequency);
    }
}

#[test]
fn test_range_keys_need_the_ordering_field() {
    let strategy = RangeStrategy::new(vec![ShardRange::new(0.0, 1.0, shard(0))], |data| {
        data.get("amount").and_then(serde_json::Value::as_f64)
    });
    assert!(strategy.shard_key(&json!({ "other": 1 })).is_err());
}
