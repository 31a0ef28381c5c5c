use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::{ApprovalProgress, ApproverSpec, EntityType, ProgressId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Submitted,
    StepAdvanced,
    Approved,
    Rejected,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::StepAdvanced => "step_advanced",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalNotification {
    pub kind: NotificationKind,
    pub progress_id: ProgressId,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// The submitter is told about every transition.
    pub submitted_by: String,
    /// Who should act next, when the progress is still pending.
    pub next_approver: Option<ApproverSpec>,
    pub correlation_id: String,
}

impl ApprovalNotification {
    pub fn for_progress(
        kind: NotificationKind,
        progress: &ApprovalProgress,
        next_approver: Option<ApproverSpec>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            progress_id: progress.id.clone(),
            entity_type: progress.entity_type,
            entity_id: progress.entity_id.clone(),
            submitted_by: progress.submitted_by.clone(),
            next_approver,
            correlation_id: correlation_id.into(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification channel closed")]
    ChannelClosed,
}

/// Fire-and-forget delivery of approval transitions to submitters and approvers.
///
/// Failures are reported back only so callers can log them; they never undo a
/// committed transition.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: ApprovalNotification) -> Result<(), NotificationError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for NoopNotificationDispatcher {
    async fn dispatch(&self, _notification: ApprovalNotification) -> Result<(), NotificationError> {
        Ok(())
    }
}
