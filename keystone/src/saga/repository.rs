use async_trait::async_trait;

use super::{SagaInstance, SagaStatus};
use crate::errors::SagaResult;
use crate::types::{SagaDefinitionId, SagaId};

/// Durable storage for saga instances.
///
/// `save` replaces the whole record; implementations must never expose a
/// partially written instance.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Inserts or replaces the instance.
    async fn save(&self, saga: &SagaInstance) -> SagaResult<()>;

    /// Loads one instance.
    async fn find_by_id(&self, id: &SagaId) -> SagaResult<Option<SagaInstance>>;

    /// Instances currently in `status`.
    async fn find_by_status(&self, status: SagaStatus) -> SagaResult<Vec<SagaInstance>>;

    /// Instances of one definition.
    async fn find_by_definition(
        &self,
        definition_id: &SagaDefinitionId,
    ) -> SagaResult<Vec<SagaInstance>>;

    /// Removes the instance. Removing an unknown id is not an error.
    async fn delete(&self, id: &SagaId) -> SagaResult<()>;
}
