//! TOML chain definitions, the format admins author chains in.
//!
//! ```toml
//! [[chains]]
//! id = "expense-high-value"
//! name = "High value expenses"
//! entity_type = "expense"
//! priority = 50
//!
//! [chains.conditions]
//! min_amount = "1000"
//!
//! [[chains.steps]]
//! order = 1
//! role = "manager"
//!
//! [[chains.steps]]
//! order = 2
//! user = "u-cfo"
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::{
    ApprovalChain, ApproverSpec, ChainConditions, ChainId, ChainStep, ChainValidationError,
    EntityType,
};

pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(Debug, Error)]
pub enum ChainFileError {
    #[error("could not parse chain definitions: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("chain `{chain_id}` has unknown entity_type `{value}`")]
    UnknownEntityType { chain_id: String, value: String },
    #[error("chain `{chain_id}` step {order} must name exactly one of `role` or `user`")]
    AmbiguousApprover { chain_id: String, order: u32 },
    #[error("duplicate chain id `{0}`")]
    DuplicateChainId(String),
    #[error(transparent)]
    Invalid(#[from] ChainValidationError),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChainFile {
    #[serde(default)]
    pub chains: Vec<ChainDefinition>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChainDefinition {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub conditions: ChainConditions,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_active() -> bool {
    true
}

fn default_required_approvals() -> u32 {
    1
}

impl ChainFile {
    pub fn parse(raw: &str) -> Result<Self, ChainFileError> {
        Ok(toml::from_str(raw)?)
    }

    /// Converts every definition into a validated chain stamped with `now`.
    pub fn into_chains(self, now: DateTime<Utc>) -> Result<Vec<ApprovalChain>, ChainFileError> {
        let mut chains: Vec<ApprovalChain> = Vec::with_capacity(self.chains.len());
        for definition in self.chains {
            if chains.iter().any(|chain| chain.id.0 == definition.id) {
                return Err(ChainFileError::DuplicateChainId(definition.id));
            }
            chains.push(definition.into_chain(now)?);
        }
        Ok(chains)
    }
}

impl ChainDefinition {
    pub fn into_chain(self, now: DateTime<Utc>) -> Result<ApprovalChain, ChainFileError> {
        let entity_type = EntityType::parse(&self.entity_type).ok_or_else(|| {
            ChainFileError::UnknownEntityType {
                chain_id: self.id.clone(),
                value: self.entity_type.clone(),
            }
        })?;

        let steps = self
            .steps
            .into_iter()
            .map(|step| {
                let approver = match (step.role, step.user) {
                    (Some(role), None) => ApproverSpec::Role(role),
                    (None, Some(user)) => ApproverSpec::User(user),
                    _ => {
                        return Err(ChainFileError::AmbiguousApprover {
                            chain_id: self.id.clone(),
                            order: step.order,
                        })
                    }
                };
                Ok(ChainStep {
                    order: step.order,
                    approver,
                    required_approvals: step.required_approvals,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let chain = ApprovalChain {
            id: ChainId(self.id),
            name: self.name,
            entity_type,
            steps,
            conditions: self.conditions,
            priority: self.priority,
            is_active: self.active,
            created_at: now,
            updated_at: now,
        }
        .with_sorted_steps();
        chain.validate()?;
        Ok(chain)
    }
}
