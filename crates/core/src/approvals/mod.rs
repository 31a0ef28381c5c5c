use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::approval::{
    normalize_key, ApprovalChain, ApprovalProgress, ApproverSpec, ChainId, ChainValidationError,
    Decision, EntityAttributes, EntityType, ProgressId, ProgressStatus, StepDecision,
};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Validation(#[from] ChainValidationError),
    #[error("chain `{chain_id}` is not active")]
    ChainInactive { chain_id: String },
    #[error("no active approval chain matches {entity_type:?} entity")]
    NoMatchingChain { entity_type: EntityType },
    #[error("{entity_type:?} `{entity_id}` already has an open approval progress")]
    DuplicateProgress { entity_type: EntityType, entity_id: String },
    #[error("approval progress `{progress_id}` is already {status:?}")]
    NotPending { progress_id: String, status: ProgressStatus },
    #[error("decision submitted for step {submitted} but current step is {expected:?}")]
    WrongStep { expected: Option<u32>, submitted: u32 },
    #[error("approver `{approver_id}` may not act on step {step} (requires {required})")]
    UnauthorizedApprover { approver_id: String, step: u32, required: String },
    #[error("approver `{approver_id}` already recorded a decision at step {step}")]
    DuplicateApproval { approver_id: String, step: u32 },
    #[error("progress `{progress_id}` belongs to chain `{expected}`, not `{actual}`")]
    ChainMismatch { progress_id: String, expected: String, actual: String },
    #[error("chain `{chain_id}` no longer defines step {step}")]
    UnknownStep { chain_id: String, step: u32 },
    #[error("chain `{chain_id}` has {pending} pending progress record(s); its steps cannot change")]
    ChainInUse { chain_id: String, pending: usize },
}

/// The acting user as reported by the identity service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverIdentity {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl ApproverIdentity {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self { user_id: user_id.into(), roles }
    }

    pub fn holds_role(&self, role: &str) -> bool {
        let role = normalize_key(role);
        self.roles.iter().any(|held| normalize_key(held) == role)
    }

    /// User steps match the id exactly; role steps match any held role, case-insensitively.
    pub fn may_act_on(&self, approver: &ApproverSpec) -> bool {
        match approver {
            ApproverSpec::User(user_id) => self.user_id == *user_id,
            ApproverSpec::Role(role) => self.holds_role(role),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionInput {
    pub step_order: u32,
    pub approver: ApproverIdentity,
    pub decision: Decision,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressTransition {
    /// Approval recorded, step threshold not reached yet.
    PartialApproval { step: u32, approvals: u32, required: u32 },
    StepAdvanced { from: u32, to: u32 },
    Approved { final_step: u32 },
    Rejected { step: u32 },
}

impl ProgressTransition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PartialApproval { .. } => "partial_approval",
            Self::StepAdvanced { .. } => "step_advanced",
            Self::Approved { .. } => "approved",
            Self::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub progress: ApprovalProgress,
    pub transition: ProgressTransition,
}

/// Picks the chain governing a new entity.
///
/// Only active, valid chains of the requested type are eligible. When several
/// match, the lowest `priority` wins, then the chain with more constrained
/// condition fields, then the oldest, then the lexically smallest id.
#[derive(Clone, Debug, Default)]
pub struct ChainSelector {
    chains: Vec<ApprovalChain>,
}

impl ChainSelector {
    pub fn new(chains: Vec<ApprovalChain>) -> Self {
        Self { chains }
    }

    pub fn select(
        &self,
        entity_type: EntityType,
        attributes: &EntityAttributes,
    ) -> Option<&ApprovalChain> {
        self.eligible(entity_type)
            .filter(|chain| chain.conditions.matches(attributes))
            .min_by(|left, right| selection_order(left, right))
    }

    /// Entity types that have no active unconditional chain to fall back on.
    pub fn coverage_gaps(&self) -> Vec<EntityType> {
        EntityType::ALL
            .into_iter()
            .filter(|entity_type| {
                !self.eligible(*entity_type).any(|chain| chain.conditions.is_unconditional())
            })
            .collect()
    }

    fn eligible(&self, entity_type: EntityType) -> impl Iterator<Item = &ApprovalChain> {
        self.chains.iter().filter(move |chain| {
            chain.entity_type == entity_type && chain.is_active && chain.validate().is_ok()
        })
    }
}

fn selection_order(left: &ApprovalChain, right: &ApprovalChain) -> Ordering {
    left.priority
        .cmp(&right.priority)
        .then_with(|| right.conditions.specificity().cmp(&left.conditions.specificity()))
        .then_with(|| left.created_at.cmp(&right.created_at))
        .then_with(|| left.id.0.cmp(&right.id.0))
}

/// Pure state machine over a chain and one progress record.
///
/// Nothing here touches storage; callers persist the returned progress
/// atomically or discard it.
#[derive(Clone, Debug, Default)]
pub struct ApprovalEvaluator;

impl ApprovalEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn start(
        &self,
        chain: &ApprovalChain,
        entity_id: impl Into<String>,
        submitted_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalProgress, ApprovalError> {
        chain.validate()?;
        if !chain.is_active {
            return Err(ApprovalError::ChainInactive { chain_id: chain.id.0.clone() });
        }

        let first_step = chain
            .first_step()
            .map(|step| step.order)
            .ok_or_else(|| ChainValidationError::NoSteps { chain_id: chain.id.0.clone() })?;

        Ok(ApprovalProgress {
            id: ProgressId(Uuid::new_v4().to_string()),
            chain_id: ChainId(chain.id.0.clone()),
            entity_type: chain.entity_type,
            entity_id: entity_id.into(),
            submitted_by: submitted_by.into(),
            current_step: Some(first_step),
            status: ProgressStatus::Pending,
            step_decisions: Vec::new(),
            version: 1,
            created_at: now,
            completed_at: None,
        })
    }

    pub fn record(
        &self,
        chain: &ApprovalChain,
        progress: &ApprovalProgress,
        input: &DecisionInput,
        now: DateTime<Utc>,
    ) -> Result<DecisionOutcome, ApprovalError> {
        if progress.chain_id != chain.id {
            return Err(ApprovalError::ChainMismatch {
                progress_id: progress.id.0.clone(),
                expected: progress.chain_id.0.clone(),
                actual: chain.id.0.clone(),
            });
        }

        if progress.status != ProgressStatus::Pending {
            return Err(ApprovalError::NotPending {
                progress_id: progress.id.0.clone(),
                status: progress.status,
            });
        }

        if progress.current_step != Some(input.step_order) {
            return Err(ApprovalError::WrongStep {
                expected: progress.current_step,
                submitted: input.step_order,
            });
        }

        let step = chain.step(input.step_order).ok_or_else(|| ApprovalError::UnknownStep {
            chain_id: chain.id.0.clone(),
            step: input.step_order,
        })?;

        if !input.approver.may_act_on(&step.approver) {
            return Err(ApprovalError::UnauthorizedApprover {
                approver_id: input.approver.user_id.clone(),
                step: step.order,
                required: step.approver.describe(),
            });
        }

        if progress.has_decided(step.order, &input.approver.user_id) {
            return Err(ApprovalError::DuplicateApproval {
                approver_id: input.approver.user_id.clone(),
                step: step.order,
            });
        }

        let mut next = progress.clone();
        next.version = progress.version + 1;
        next.step_decisions.push(StepDecision {
            step: step.order,
            approver_id: input.approver.user_id.clone(),
            decision: input.decision,
            decided_at: now,
            comment: input.comment.clone().filter(|comment| !comment.trim().is_empty()),
        });

        let transition = match input.decision {
            Decision::Reject => {
                finish(&mut next, ProgressStatus::Rejected, now);
                ProgressTransition::Rejected { step: step.order }
            }
            Decision::Approve => {
                let approvals = next.approvals_at(step.order) as u32;
                if approvals < step.required_approvals {
                    ProgressTransition::PartialApproval {
                        step: step.order,
                        approvals,
                        required: step.required_approvals,
                    }
                } else if let Some(following) = chain.next_step_after(step.order) {
                    next.current_step = Some(following.order);
                    ProgressTransition::StepAdvanced { from: step.order, to: following.order }
                } else {
                    finish(&mut next, ProgressStatus::Approved, now);
                    ProgressTransition::Approved { final_step: step.order }
                }
            }
        };

        Ok(DecisionOutcome { progress: next, transition })
    }
}

fn finish(progress: &mut ApprovalProgress, status: ProgressStatus, now: DateTime<Utc>) {
    progress.status = status;
    progress.current_step = None;
    progress.completed_at = Some(now);
}
