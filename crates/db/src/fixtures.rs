use chrono::Utc;
use thiserror::Error;

use wrkspace_core::approvals::ChainSelector;
use wrkspace_core::chain_file::{ChainFile, ChainFileError};
use wrkspace_core::domain::approval::{ApprovalChain, EntityType};
use wrkspace_core::errors::ApplicationError;

use crate::connection::DbPool;
use crate::repositories::{ChainRepository, RepositoryError, SqlChainRepository};
use crate::service::ApprovalService;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error(transparent)]
    Definitions(#[from] ChainFileError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

/// Starter chains covering every entity type, so a fresh install can route
/// submissions before an admin authors anything.
pub struct DefaultChainSeed;

impl DefaultChainSeed {
    pub const TOML: &str = include_str!("../../../config/fixtures/default_chains.toml");

    pub fn chains() -> Result<Vec<ApprovalChain>, ChainFileError> {
        ChainFile::parse(Self::TOML)?.into_chains(Utc::now())
    }

    /// Upserts the starter chains in one transaction; re-running restores them
    /// to their shipped shape.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, SeedError> {
        let saved = ApprovalService::sql(pool.clone()).save_chains(Self::chains()?).await?;
        let chains_seeded = saved
            .into_iter()
            .map(|chain| ChainSeedInfo {
                chain_id: chain.id.0,
                entity_type: chain.entity_type,
                steps: chain.steps.len(),
            })
            .collect();

        Ok(SeedResult { chains_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, SeedError> {
        let repo = SqlChainRepository::new(pool.clone());
        let mut checks = Vec::new();

        for expected in Self::chains()? {
            let stored = repo.find_by_id(&expected.id).await?;
            let matches = stored.is_some_and(|stored| {
                stored.is_active
                    && stored.entity_type == expected.entity_type
                    && stored.steps == expected.steps
                    && stored.conditions == expected.conditions
            });
            checks.push((expected.id.0, matches));
        }

        let gaps = ChainSelector::new(repo.list_all().await?).coverage_gaps();
        for entity_type in EntityType::ALL {
            let covered = !gaps.contains(&entity_type);
            checks.push((format!("fallback:{}", entity_type.as_str()), covered));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub chains_seeded: Vec<ChainSeedInfo>,
}

#[derive(Debug)]
pub struct ChainSeedInfo {
    pub chain_id: String,
    pub entity_type: EntityType,
    pub steps: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}
