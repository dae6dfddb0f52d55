//! Core types for the keystone coordination layer.
//!
//! Identifiers use smart constructors so that an invalid id can never reach
//! the dispatch core, the event store, the saga orchestrator, the shard
//! manager or the service mesh ("parse, don't validate").

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[nutype(
            sanitize(trim),
            validate(not_empty, len_char_max = 255),
            derive(
                Debug,
                Clone,
                PartialEq,
                Eq,
                PartialOrd,
                Ord,
                Hash,
                AsRef,
                Deref,
                Display,
                Serialize,
                Deserialize
            )
        )]
        pub struct $name(String);
    };
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[nutype(
            derive(
                Debug,
                Clone,
                Copy,
                PartialEq,
                Eq,
                PartialOrd,
                Ord,
                Hash,
                AsRef,
                Deref,
                Display,
                Serialize,
                Deserialize
            )
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh, time-ordered (UUIDv7) identifier.
            pub fn generate() -> Self {
                Self::new(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::generate()
            }
        }
    };
}

string_id!(
    /// Identifies one aggregate and therefore one event stream.
    ///
    /// Non-empty after trimming and at most 255 characters.
    AggregateId
);

string_id!(
    /// Stable type identifier of an event, e.g. `"AccountOpened"`.
    EventType
);

string_id!(
    /// Stable type identifier of a command; the routing key of the command bus.
    CommandType
);

string_id!(
    /// Stable type identifier of a query; the routing key of the query bus.
    QueryType
);

string_id!(
    /// Unique name of a registered projection.
    ProjectionName
);

string_id!(
    /// Identifies one physical data partition.
    ShardId
);

string_id!(
    /// Identifies a service in the mesh registry.
    ServiceId
);

string_id!(
    /// Identifies one runtime instance of a service.
    InstanceId
);

string_id!(
    /// Identifies a saga definition (the "program" a saga instance runs).
    SagaDefinitionId
);

string_id!(
    /// Name of one step within a saga definition.
    StepName
);

string_id!(
    /// Name under which a sharding strategy is registered.
    StrategyName
);

uuid_id!(
    /// Globally unique event identifier; UUIDv7 gives creation order.
    EventId
);

uuid_id!(
    /// Unique identifier of a submitted command.
    CommandId
);

uuid_id!(
    /// Unique identifier of a submitted query.
    QueryId
);

uuid_id!(
    /// Unique identifier of a saga instance.
    SagaId
);

uuid_id!(
    /// Unique identifier of a mesh request.
    RequestId
);

/// The version of an event within its aggregate stream.
///
/// Version 0 means "no events yet"; the first persisted event is version 1
/// and every following event increments by exactly one.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct EventVersion(u64);

impl EventVersion {
    /// The version of an aggregate that has no events.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the next version after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// Returns the version `count` steps after this one.
    #[must_use]
    pub fn advance(self, count: u64) -> Self {
        Self::new(self.into_inner() + count)
    }

    /// Whether this is the "no events" version.
    pub fn is_initial(self) -> bool {
        self.into_inner() == 0
    }
}

impl Default for EventVersion {
    fn default() -> Self {
        Self::initial()
    }
}

/// A timestamp for when something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
