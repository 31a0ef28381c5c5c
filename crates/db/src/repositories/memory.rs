use std::collections::HashMap;

use tokio::sync::RwLock;

use wrkspace_core::domain::approval::{
    ApprovalChain, ApprovalProgress, ChainId, EntityType, ProgressId, ProgressStatus,
};

use super::{ChainRepository, ProgressRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryChainRepository {
    chains: RwLock<HashMap<String, ApprovalChain>>,
}

#[async_trait::async_trait]
impl ChainRepository for InMemoryChainRepository {
    async fn find_by_id(&self, id: &ChainId) -> Result<Option<ApprovalChain>, RepositoryError> {
        let chains = self.chains.read().await;
        Ok(chains.get(&id.0).cloned())
    }

    async fn list_active(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<ApprovalChain>, RepositoryError> {
        let chains = self.chains.read().await;
        let mut active: Vec<ApprovalChain> = chains
            .values()
            .filter(|chain| chain.entity_type == entity_type && chain.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.0.cmp(&b.id.0))
        });
        Ok(active)
    }

    async fn list_all(&self) -> Result<Vec<ApprovalChain>, RepositoryError> {
        let chains = self.chains.read().await;
        let mut all: Vec<ApprovalChain> = chains.values().cloned().collect();
        all.sort_by(|a, b| {
            a.entity_type
                .as_str()
                .cmp(b.entity_type.as_str())
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.0.cmp(&b.id.0))
        });
        Ok(all)
    }

    async fn save_all(&self, incoming: Vec<ApprovalChain>) -> Result<(), RepositoryError> {
        let mut chains = self.chains.write().await;
        for mut chain in incoming {
            if let Some(existing) = chains.get(&chain.id.0) {
                chain.created_at = existing.created_at;
            }
            chains.insert(chain.id.0.clone(), chain);
        }
        Ok(())
    }

    async fn set_active(&self, id: &ChainId, is_active: bool) -> Result<bool, RepositoryError> {
        let mut chains = self.chains.write().await;
        match chains.get_mut(&id.0) {
            Some(chain) => {
                chain.is_active = is_active;
                chain.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Progress store whose writes are atomic under a single write lock, mirroring
/// the version check the SQL store performs in a transaction.
#[derive(Default)]
pub struct InMemoryProgressRepository {
    records: RwLock<HashMap<String, ApprovalProgress>>,
}

#[async_trait::async_trait]
impl ProgressRepository for InMemoryProgressRepository {
    async fn find_by_id(
        &self,
        id: &ProgressId,
    ) -> Result<Option<ApprovalProgress>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&id.0).cloned())
    }

    async fn find_open_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ApprovalProgress>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|progress| {
                progress.entity_type == entity_type
                    && progress.entity_id == entity_id
                    && progress.status == ProgressStatus::Pending
            })
            .cloned())
    }

    async fn insert(&self, progress: ApprovalProgress) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        let open_exists = records.values().any(|existing| {
            existing.entity_type == progress.entity_type
                && existing.entity_id == progress.entity_id
                && existing.status == ProgressStatus::Pending
        });
        if open_exists || records.contains_key(&progress.id.0) {
            return Ok(false);
        }

        records.insert(progress.id.0.clone(), progress);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        progress: ApprovalProgress,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        match records.get_mut(&progress.id.0) {
            Some(stored) if stored.version == expected_version => {
                *stored = progress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalProgress>, RepositoryError> {
        let records = self.records.read().await;
        let mut pending: Vec<ApprovalProgress> = records
            .values()
            .filter(|progress| progress.status == ProgressStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use wrkspace_core::domain::approval::{
        ApprovalChain, ApprovalProgress, ApproverSpec, ChainConditions, ChainId, ChainStep,
        EntityType, ProgressId, ProgressStatus,
    };

    use crate::repositories::{
        ChainRepository, InMemoryChainRepository, InMemoryProgressRepository, ProgressRepository,
    };

    fn progress(id: &str, entity_id: &str) -> ApprovalProgress {
        ApprovalProgress {
            id: ProgressId(id.to_string()),
            chain_id: ChainId("chain-1".to_string()),
            entity_type: EntityType::Request,
            entity_id: entity_id.to_string(),
            submitted_by: "u-employee".to_string(),
            current_step: Some(1),
            status: ProgressStatus::Pending,
            step_decisions: Vec::new(),
            version: 1,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn in_memory_chain_repo_round_trip_and_deactivate() {
        let repo = InMemoryChainRepository::default();
        let now = Utc::now();
        let chain = ApprovalChain {
            id: ChainId("chain-1".to_string()),
            name: "Requests".to_string(),
            entity_type: EntityType::Request,
            steps: vec![ChainStep {
                order: 1,
                approver: ApproverSpec::Role("hr".to_string()),
                required_approvals: 1,
            }],
            conditions: ChainConditions::default(),
            priority: 100,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        repo.save(chain.clone()).await.expect("save");
        assert_eq!(repo.list_active(EntityType::Request).await.expect("list").len(), 1);

        assert!(repo.set_active(&chain.id, false).await.expect("deactivate"));
        assert!(repo.list_active(EntityType::Request).await.expect("list").is_empty());
        assert_eq!(repo.list_all().await.expect("list all").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_chain_save_keeps_creation_time() {
        let repo = InMemoryChainRepository::default();
        let created_at = Utc::now() - Duration::days(10);
        let mut chain = ApprovalChain {
            id: ChainId("chain-1".to_string()),
            name: "Requests".to_string(),
            entity_type: EntityType::Request,
            steps: vec![ChainStep {
                order: 1,
                approver: ApproverSpec::Role("hr".to_string()),
                required_approvals: 1,
            }],
            conditions: ChainConditions::default(),
            priority: 100,
            is_active: true,
            created_at,
            updated_at: created_at,
        };
        repo.save(chain.clone()).await.expect("save");

        chain.name = "Renamed".to_string();
        chain.created_at = Utc::now();
        chain.updated_at = chain.created_at;
        repo.save_all(vec![chain.clone()]).await.expect("resave");

        let stored = repo.find_by_id(&chain.id).await.expect("find").expect("exists");
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.created_at, created_at);
        assert_eq!(stored.updated_at, chain.updated_at);
    }

    #[tokio::test]
    async fn in_memory_progress_repo_enforces_single_open_record() {
        let repo = InMemoryProgressRepository::default();

        assert!(repo.insert(progress("p-1", "REQ-1")).await.expect("first"));
        assert!(!repo.insert(progress("p-2", "REQ-1")).await.expect("duplicate"));
        assert!(repo.insert(progress("p-3", "REQ-2")).await.expect("other entity"));
    }

    #[tokio::test]
    async fn in_memory_compare_and_swap_checks_version() {
        let repo = InMemoryProgressRepository::default();
        let original = progress("p-1", "REQ-1");
        repo.insert(original.clone()).await.expect("insert");

        let mut next = original.clone();
        next.version = 2;
        next.status = ProgressStatus::Rejected;
        next.current_step = None;

        assert!(!repo.compare_and_swap(next.clone(), 7).await.expect("stale"));
        assert!(repo.compare_and_swap(next, 1).await.expect("fresh"));

        let stored = repo.find_by_id(&original.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, ProgressStatus::Rejected);
        assert!(repo.list_pending().await.expect("pending").is_empty());
        assert!(repo
            .find_open_for_entity(EntityType::Request, "REQ-1")
            .await
            .expect("open")
            .is_none());
    }
}
