//! Property test generators for domain types.
//!
//! Every generator only produces values that pass the type's validation.

use proptest::prelude::*;
use serde_json::{Map, Value};

use crate::message::Event;
use crate::types::{AggregateId, EventType, EventVersion};

/// Valid `AggregateId` values.
pub fn arb_aggregate_id() -> impl Strategy<Value = AggregateId> {
    "[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}"
        .prop_filter_map("invalid AggregateId", |s| AggregateId::try_new(s).ok())
}

/// Valid `EventType` values in `PascalCase`.
pub fn arb_event_type() -> impl Strategy<Value = EventType> {
    "[A-Z][a-zA-Z]{2,23}".prop_filter_map("invalid EventType", |s| EventType::try_new(s).ok())
}

/// Scalar JSON values.
pub fn arb_json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
    ]
}

/// JSON objects of up to eight fields, nested at most two levels deep.
pub fn arb_payload() -> impl Strategy<Value = Value> {
    let value = arb_json_leaf().prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>())),
        ]
    });
    prop::collection::btree_map("[a-z_]{1,10}", value, 0..8)
        .prop_map(|fields| Value::Object(fields.into_iter().collect()))
}

/// Gapless event histories for one aggregate, versions `1..=len`.
pub fn arb_event_history(max_len: usize) -> impl Strategy<Value = Vec<Event>> {
    (
        arb_aggregate_id(),
        prop::collection::vec((arb_event_type(), arb_payload()), 1..=max_len.max(1)),
    )
        .prop_map(|(aggregate_id, entries)| {
            let mut version = EventVersion::initial();
            entries
                .into_iter()
                .map(|(event_type, payload)| {
                    version = version.next();
                    Event::new(aggregate_id.clone(), event_type, payload, version)
                })
                .collect()
        })
}
