use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keystone::errors::SagaResult;
use keystone::saga::{SagaInstance, SagaRepository, SagaStatus};
use keystone::types::{SagaDefinitionId, SagaId};
use parking_lot::RwLock;

/// Saga instances kept in a map. Listings are ordered by start time.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaRepository {
    sagas: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
}

impl InMemorySagaRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.sagas.read().len()
    }

    /// Whether no instance is stored.
    pub fn is_empty(&self) -> bool {
        self.sagas.read().is_empty()
    }

    fn select(&self, keep: impl Fn(&SagaInstance) -> bool) -> Vec<SagaInstance> {
        let mut found: Vec<SagaInstance> = self
            .sagas
            .read()
            .values()
            .filter(|saga| keep(saga))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        found
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn save(&self, saga: &SagaInstance) -> SagaResult<()> {
        self.sagas.write().insert(saga.id, saga.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &SagaId) -> SagaResult<Option<SagaInstance>> {
        Ok(self.sagas.read().get(id).cloned())
    }

    async fn find_by_status(&self, status: SagaStatus) -> SagaResult<Vec<SagaInstance>> {
        Ok(self.select(|saga| saga.status == status))
    }

    async fn find_by_definition(
        &self,
        definition_id: &SagaDefinitionId,
    ) -> SagaResult<Vec<SagaInstance>> {
        Ok(self.select(|saga| &saga.definition_id == definition_id))
    }

    async fn delete(&self, id: &SagaId) -> SagaResult<()> {
        self.sagas.write().remove(id);
        Ok(())
    }
}
