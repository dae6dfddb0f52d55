//! Projections: read models folded from published events.
//!
//! A [`ProjectionHandler`] is a fold. It receives the projection's current
//! data (JSON `null` for a fresh projection) and one event, and returns the
//! new data. Because rebuilding always starts from `null`, rebuilding twice
//! from the same history yields identical data.
//!
//! Handler failures are isolated: the failing projection keeps its previous
//! data, other projections continue, and the failure is logged and sent on
//! the manager's error channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::cqrs::EventHandler;
use crate::errors::{CoordinationError, ProjectionError, ProjectionResult};
use crate::event_sourcing::EventSourcingEngine;
use crate::event_store::EventStore;
use crate::message::{Event, EventFilter};
use crate::types::{EventId, EventVersion, ProjectionName};

const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Builds one read model.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    /// Unique projection name.
    fn name(&self) -> &ProjectionName;

    /// Whether this projection folds the event.
    fn can_handle(&self, event: &Event) -> bool;

    /// Folds `event` into `current` and returns the new data.
    async fn handle(&self, current: &Value, event: &Event) -> ProjectionResult<Value>;
}

/// A materialized read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Projection name
    pub name: ProjectionName,
    /// Last event folded in
    pub last_processed_event_id: Option<EventId>,
    /// Version of the last event folded in
    pub last_processed_version: EventVersion,
    /// Materialized data
    pub data: Value,
}

impl Projection {
    /// An empty projection.
    pub fn empty(name: ProjectionName) -> Self {
        Self {
            name,
            last_processed_event_id: None,
            last_processed_version: EventVersion::initial(),
            data: Value::Null,
        }
    }

    fn advance(&mut self, event: &Event, data: Value) {
        self.last_processed_event_id = Some(event.id);
        self.last_processed_version = event.version;
        self.data = data;
    }
}

/// A projection handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionFailure {
    /// The failing projection
    pub projection: ProjectionName,
    /// The event it failed on
    pub event_id: EventId,
    /// The handler's error
    pub error: String,
}

impl From<ProjectionFailure> for ProjectionError {
    fn from(failure: ProjectionFailure) -> Self {
        Self::HandlerFailed {
            projection: failure.projection,
            event_id: failure.event_id,
            message: failure.error,
        }
    }
}

/// Outcome of one `update_projections` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionUpdateReport {
    /// Successful folds
    pub updated: usize,
    /// Failed folds
    pub failures: Vec<ProjectionFailure>,
}

/// Owns the registered projections and their data.
pub struct ProjectionManager<S: ?Sized> {
    engine: EventSourcingEngine<S>,
    handlers: RwLock<Vec<Arc<dyn ProjectionHandler>>>,
    projections: RwLock<BTreeMap<ProjectionName, Projection>>,
    update_lock: Mutex<()>,
    errors: broadcast::Sender<ProjectionFailure>,
}

impl<S: ?Sized> std::fmt::Debug for ProjectionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionManager")
            .field("projections", &self.projections.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<S: EventStore + ?Sized> ProjectionManager<S> {
    /// Creates a manager reading history through `engine`.
    pub fn new(engine: EventSourcingEngine<S>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            engine,
            handlers: RwLock::new(Vec::new()),
            projections: RwLock::new(BTreeMap::new()),
            update_lock: Mutex::new(()),
            errors,
        }
    }

    /// Receives every projection failure from now on.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ProjectionFailure> {
        self.errors.subscribe()
    }

    /// Registers a projection and initializes it empty.
    ///
    /// # Errors
    /// `ProjectionError::DuplicateProjection` if the name is taken.
    pub fn register_projection(&self, handler: Arc<dyn ProjectionHandler>) -> ProjectionResult<()> {
        let mut handlers = self.handlers.write();
        let name = handler.name().clone();
        if handlers.iter().any(|h| *h.name() == name) {
            return Err(ProjectionError::DuplicateProjection(name));
        }
        self.projections
            .write()
            .insert(name.clone(), Projection::empty(name.clone()));
        handlers.push(handler);
        debug!(projection = %name, "projection registered");
        Ok(())
    }

    /// Data of the named projection.
    pub fn get_projection(&self, name: &ProjectionName) -> Option<Value> {
        self.projections.read().get(name).map(|p| p.data.clone())
    }

    /// Full record of the named projection.
    pub fn get_projection_record(&self, name: &ProjectionName) -> Option<Projection> {
        self.projections.read().get(name).cloned()
    }

    /// Copy of every projection.
    pub fn get_all_projections(&self) -> BTreeMap<ProjectionName, Projection> {
        self.projections.read().clone()
    }

    fn handlers(&self) -> Vec<Arc<dyn ProjectionHandler>> {
        self.handlers.read().clone()
    }

    fn report_failure(&self, failure: ProjectionFailure) -> ProjectionFailure {
        self.engine.metrics().projection_failures.increment();
        warn!(
            projection = %failure.projection,
            event_id = %failure.event_id,
            error = %failure.error,
            "projection handler failed"
        );
        // No receivers is fine.
        let _ = self.errors.send(failure.clone());
        failure
    }

    /// Folds `events`, in order, into every projection that claims them.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn update_projections(&self, events: &[Event]) -> ProjectionUpdateReport {
        let _guard = self.update_lock.lock().await;
        let handlers = self.handlers();
        let mut report = ProjectionUpdateReport::default();

        for event in events {
            for handler in &handlers {
                if !handler.can_handle(event) {
                    continue;
                }
                let name = handler.name();
                let current = self
                    .projections
                    .read()
                    .get(name)
                    .map_or(Value::Null, |p| p.data.clone());

                match handler.handle(&current, event).await {
                    Ok(data) => {
                        {
                            let mut projections = self.projections.write();
                            if let Some(projection) = projections.get_mut(name) {
                                projection.advance(event, data);
                            }
                        }
                        self.engine.metrics().projections_updated.increment();
                        report.updated += 1;
                    }
                    Err(error) => {
                        let failure = self.report_failure(ProjectionFailure {
                            projection: name.clone(),
                            event_id: event.id,
                            error: error.to_string(),
                        });
                        report.failures.push(failure);
                    }
                }
            }
        }
        report
    }

    /// Resets the named projection and replays the (filtered) history into it.
    ///
    /// The new data replaces the old only if every fold succeeds.
    #[instrument(skip(self))]
    pub async fn rebuild_projection(
        &self,
        name: &ProjectionName,
        filter: Option<&EventFilter>,
    ) -> ProjectionResult<Projection> {
        let handler = self
            .handlers()
            .into_iter()
            .find(|h| h.name() == name)
            .ok_or_else(|| ProjectionError::NotFound(name.clone()))?;

        let _guard = self.update_lock.lock().await;
        let all = EventFilter::all();
        let events = self.engine.query_events(filter.unwrap_or(&all)).await?;

        let mut rebuilt = Projection::empty(name.clone());
        for event in events.iter().filter(|e| handler.can_handle(e)) {
            match handler.handle(&rebuilt.data, event).await {
                Ok(data) => rebuilt.advance(event, data),
                Err(error) => {
                    let failure = self.report_failure(ProjectionFailure {
                        projection: name.clone(),
                        event_id: event.id,
                        error: error.to_string(),
                    });
                    return Err(failure.into());
                }
            }
        }

        self.projections.write().insert(name.clone(), rebuilt.clone());
        info!(projection = %name, events = events.len(), "projection rebuilt");
        Ok(rebuilt)
    }
}

#[async_trait]
impl<S: EventStore + ?Sized + 'static> EventHandler for ProjectionManager<S> {
    fn name(&self) -> &str {
        "projection-manager"
    }

    async fn handle(&self, event: &Event) -> Result<(), CoordinationError> {
        // Failures are reported on the error channel, not to the publisher.
        self.update_projections(std::slice::from_ref(event)).await;
        Ok(())
    }
}
