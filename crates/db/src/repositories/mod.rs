use async_trait::async_trait;
use thiserror::Error;

use wrkspace_core::domain::approval::{
    ApprovalChain, ApprovalProgress, ChainId, EntityType, ProgressId,
};
use wrkspace_core::errors::ApplicationError;

pub mod chain;
pub mod memory;
pub mod progress;

pub use chain::SqlChainRepository;
pub use memory::{InMemoryChainRepository, InMemoryProgressRepository};
pub use progress::SqlProgressRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Persistence(value.to_string())
    }
}

#[async_trait]
pub trait ChainRepository: Send + Sync {
    async fn find_by_id(&self, id: &ChainId) -> Result<Option<ApprovalChain>, RepositoryError>;
    async fn list_active(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<ApprovalChain>, RepositoryError>;
    async fn list_all(&self) -> Result<Vec<ApprovalChain>, RepositoryError>;
    async fn save(&self, chain: ApprovalChain) -> Result<(), RepositoryError> {
        self.save_all(vec![chain]).await
    }

    /// Upserts every chain or none of them. A stored chain keeps its `created_at`.
    async fn save_all(&self, chains: Vec<ApprovalChain>) -> Result<(), RepositoryError>;
    /// Returns `false` when no chain with `id` exists.
    async fn set_active(&self, id: &ChainId, is_active: bool) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ProgressId,
    ) -> Result<Option<ApprovalProgress>, RepositoryError>;

    async fn find_open_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ApprovalProgress>, RepositoryError>;

    /// Returns `false` without writing when the entity already has an open progress.
    async fn insert(&self, progress: ApprovalProgress) -> Result<bool, RepositoryError>;

    /// Persists `progress` only if the stored version still equals `expected_version`.
    ///
    /// Returns `false` when another writer got there first; nothing is written then.
    async fn compare_and_swap(
        &self,
        progress: ApprovalProgress,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    /// Pending records, oldest first.
    async fn list_pending(&self) -> Result<Vec<ApprovalProgress>, RepositoryError>;
}
