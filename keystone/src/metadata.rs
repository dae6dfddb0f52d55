//! Event metadata: causation, correlation and actor attribution.
//!
//! Metadata is optional on every event. The audit trail uses the actor id to
//! answer "what did this actor do", and causation/correlation ids let callers
//! follow a command through the events and saga steps it triggered.

use std::collections::BTreeMap;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CommandId, EventId, SagaId};

/// Links every message that belongs to one logical workflow.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Deref,
    Display,
    Serialize,
    Deserialize
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Starts a new correlation scope.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Identifies the message that directly caused an event.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Deref,
    Display,
    Serialize,
    Deserialize
))]
pub struct CausationId(Uuid);

impl From<EventId> for CausationId {
    fn from(event_id: EventId) -> Self {
        Self::new(*event_id.as_ref())
    }
}

impl From<CommandId> for CausationId {
    fn from(command_id: CommandId) -> Self {
        Self::new(*command_id.as_ref())
    }
}

impl From<SagaId> for CausationId {
    fn from(saga_id: SagaId) -> Self {
        Self::new(*saga_id.as_ref())
    }
}

/// The user or system actor on whose behalf a command ran.
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
pub struct ActorId(String);

/// Contextual information attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The message that directly caused this event
    pub causation_id: Option<CausationId>,
    /// The workflow this event belongs to
    pub correlation_id: Option<CorrelationId>,
    /// Who triggered the event
    pub actor_id: Option<ActorId>,
    /// Free-form metadata
    #[serde(default)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl EventMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the causation id.
    #[must_use]
    pub fn caused_by(mut self, causation_id: impl Into<CausationId>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the actor id.
    #[must_use]
    pub fn with_actor(mut self, actor_id: ActorId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Adds a custom metadata field.
    #[must_use]
    pub fn with_custom<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Whether nothing has been set.
    pub fn is_empty(&self) -> bool {
        self.causation_id.is_none()
            && self.correlation_id.is_none()
            && self.actor_id.is_none()
            && self.custom.is_empty()
    }
}
