use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Expense,
    Leave,
    Request,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [Self::Expense, Self::Leave, Self::Request];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Leave => "leave",
            Self::Request => "request",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "expense" => Some(Self::Expense),
            "leave" => Some(Self::Leave),
            "request" => Some(Self::Request),
            _ => None,
        }
    }
}

/// Who may act on a step: anyone holding a role, or one specific user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ApproverSpec {
    Role(String),
    User(String),
}

impl ApproverSpec {
    pub fn describe(&self) -> String {
        match self {
            Self::Role(role) => format!("role `{role}`"),
            Self::User(user_id) => format!("user `{user_id}`"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    pub order: u32,
    pub approver: ApproverSpec,
    pub required_approvals: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_days: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_days: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl ChainConditions {
    /// Ranges are inclusive. A bound on an attribute the entity does not carry never matches.
    pub fn matches(&self, attributes: &EntityAttributes) -> bool {
        if !within(attributes.amount, self.min_amount, self.max_amount) {
            return false;
        }

        if !within(attributes.days, self.min_days, self.max_days) {
            return false;
        }

        if self.categories.is_empty() {
            return true;
        }

        let Some(category) = attributes.category.as_deref() else {
            return false;
        };
        let category = normalize_key(category);
        self.categories.iter().any(|candidate| normalize_key(candidate) == category)
    }

    pub fn specificity(&self) -> usize {
        usize::from(self.min_amount.is_some())
            + usize::from(self.max_amount.is_some())
            + usize::from(self.min_days.is_some())
            + usize::from(self.max_days.is_some())
            + usize::from(!self.categories.is_empty())
    }

    pub fn is_unconditional(&self) -> bool {
        self.specificity() == 0
    }
}

fn within(value: Option<Decimal>, min: Option<Decimal>, max: Option<Decimal>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }

    let Some(value) = value else {
        return false;
    };

    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAttributes {
    pub amount: Option<Decimal>,
    pub days: Option<Decimal>,
    pub category: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChainValidationError {
    #[error("chain `{chain_id}` has no steps")]
    NoSteps { chain_id: String },
    #[error("chain `{chain_id}` has an empty name")]
    EmptyName { chain_id: String },
    #[error("chain `{chain_id}` declares step order {order} more than once")]
    DuplicateStepOrder { chain_id: String, order: u32 },
    #[error("chain `{chain_id}` lists step {next} after step {previous}")]
    StepsOutOfOrder { chain_id: String, previous: u32, next: u32 },
    #[error("chain `{chain_id}` step {order} must require at least one approval")]
    ZeroRequiredApprovals { chain_id: String, order: u32 },
    #[error("chain `{chain_id}` step {order} has an empty approver")]
    EmptyApprover { chain_id: String, order: u32 },
    #[error("chain `{chain_id}` has inverted {field} range")]
    InvertedRange { chain_id: String, field: &'static str },
    #[error("chain `{chain_id}` has a negative `{field}` bound")]
    NegativeBound { chain_id: String, field: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalChain {
    pub id: ChainId,
    pub name: String,
    pub entity_type: EntityType,
    pub steps: Vec<ChainStep>,
    pub conditions: ChainConditions,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalChain {
    pub fn validate(&self) -> Result<(), ChainValidationError> {
        let chain_id = &self.id.0;

        if self.name.trim().is_empty() {
            return Err(ChainValidationError::EmptyName { chain_id: chain_id.clone() });
        }

        if self.steps.is_empty() {
            return Err(ChainValidationError::NoSteps { chain_id: chain_id.clone() });
        }

        let mut previous: Option<u32> = None;
        for step in &self.steps {
            if let Some(previous) = previous {
                if step.order == previous {
                    return Err(ChainValidationError::DuplicateStepOrder {
                        chain_id: chain_id.clone(),
                        order: step.order,
                    });
                }
                if step.order < previous {
                    // A duplicate further back still reads as a duplicate, not a misordering.
                    if self.steps.iter().filter(|other| other.order == step.order).count() > 1 {
                        return Err(ChainValidationError::DuplicateStepOrder {
                            chain_id: chain_id.clone(),
                            order: step.order,
                        });
                    }
                    return Err(ChainValidationError::StepsOutOfOrder {
                        chain_id: chain_id.clone(),
                        previous,
                        next: step.order,
                    });
                }
            }
            previous = Some(step.order);

            if step.required_approvals == 0 {
                return Err(ChainValidationError::ZeroRequiredApprovals {
                    chain_id: chain_id.clone(),
                    order: step.order,
                });
            }

            let approver = match &step.approver {
                ApproverSpec::Role(value) | ApproverSpec::User(value) => value,
            };
            if approver.trim().is_empty() {
                return Err(ChainValidationError::EmptyApprover {
                    chain_id: chain_id.clone(),
                    order: step.order,
                });
            }
        }

        validate_range(
            chain_id,
            "amount",
            "min_amount",
            "max_amount",
            self.conditions.min_amount,
            self.conditions.max_amount,
        )?;
        validate_range(
            chain_id,
            "days",
            "min_days",
            "max_days",
            self.conditions.min_days,
            self.conditions.max_days,
        )?;

        Ok(())
    }

    /// Returns a copy with steps sorted by order, the shape admin-authored input is normalized to.
    pub fn with_sorted_steps(mut self) -> Self {
        self.steps.sort_by_key(|step| step.order);
        self
    }

    pub fn step(&self, order: u32) -> Option<&ChainStep> {
        self.steps.iter().find(|step| step.order == order)
    }

    pub fn first_step(&self) -> Option<&ChainStep> {
        self.steps.iter().min_by_key(|step| step.order)
    }

    pub fn next_step_after(&self, order: u32) -> Option<&ChainStep> {
        self.steps.iter().filter(|step| step.order > order).min_by_key(|step| step.order)
    }
}

fn validate_range(
    chain_id: &str,
    field: &'static str,
    min_field: &'static str,
    max_field: &'static str,
    min: Option<Decimal>,
    max: Option<Decimal>,
) -> Result<(), ChainValidationError> {
    if min.is_some_and(|min| min.is_sign_negative()) {
        return Err(ChainValidationError::NegativeBound {
            chain_id: chain_id.to_string(),
            field: min_field,
        });
    }
    if max.is_some_and(|max| max.is_sign_negative()) {
        return Err(ChainValidationError::NegativeBound {
            chain_id: chain_id.to_string(),
            field: max_field,
        });
    }
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(ChainValidationError::InvertedRange {
                chain_id: chain_id.to_string(),
                field,
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDecision {
    pub step: u32,
    pub approver_id: String,
    pub decision: Decision,
    pub decided_at: DateTime<Utc>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalProgress {
    pub id: ProgressId,
    pub chain_id: ChainId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub submitted_by: String,
    /// Order of the step awaiting decisions; `None` once the progress is terminal.
    pub current_step: Option<u32>,
    pub status: ProgressStatus,
    pub step_decisions: Vec<StepDecision>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApprovalProgress {
    pub fn approvals_at(&self, step: u32) -> usize {
        self.step_decisions
            .iter()
            .filter(|entry| entry.step == step && entry.decision == Decision::Approve)
            .count()
    }

    pub fn has_decided(&self, step: u32, approver_id: &str) -> bool {
        self.step_decisions
            .iter()
            .any(|entry| entry.step == step && entry.approver_id == approver_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
