use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use wrkspace_core::approvals::{
    ApprovalError, ApprovalEvaluator, ApproverIdentity, ChainSelector, DecisionInput,
    DecisionOutcome, ProgressTransition,
};
use wrkspace_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use wrkspace_core::config::ApprovalsConfig;
use wrkspace_core::domain::approval::{
    ApprovalChain, ApprovalProgress, ChainId, EntityAttributes, EntityType, ProgressId,
};
use wrkspace_core::errors::ApplicationError;
use wrkspace_core::notifications::{
    ApprovalNotification, NoopNotificationDispatcher, NotificationDispatcher, NotificationError,
    NotificationKind,
};

use crate::repositories::{
    ChainRepository, ProgressRepository, SqlChainRepository, SqlProgressRepository,
};
use crate::DbPool;

const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 5;

/// Orchestrates chain selection, progress creation and decision recording over
/// the repositories.
///
/// Every decision is a read-evaluate-write cycle guarded by the progress
/// version; a lost race re-reads and re-evaluates against the fresh record.
pub struct ApprovalService {
    chains: Arc<dyn ChainRepository>,
    progress: Arc<dyn ProgressRepository>,
    notifier: Arc<dyn NotificationDispatcher>,
    notifications_enabled: bool,
    audit: Arc<dyn AuditSink>,
    evaluator: ApprovalEvaluator,
    max_write_attempts: u32,
}

impl ApprovalService {
    pub fn new(chains: Arc<dyn ChainRepository>, progress: Arc<dyn ProgressRepository>) -> Self {
        Self {
            chains,
            progress,
            notifier: Arc::new(NoopNotificationDispatcher),
            notifications_enabled: true,
            audit: Arc::new(NoopAuditSink),
            evaluator: ApprovalEvaluator::new(),
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }

    pub fn sql(pool: DbPool) -> Self {
        Self::new(
            Arc::new(SqlChainRepository::new(pool.clone())),
            Arc::new(SqlProgressRepository::new(pool)),
        )
    }

    pub fn with_config(mut self, config: &ApprovalsConfig) -> Self {
        self.max_write_attempts = config.max_write_attempts.max(1);
        self.notifications_enabled = config.notifications_enabled;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    pub async fn select_chain(
        &self,
        entity_type: EntityType,
        attributes: &EntityAttributes,
    ) -> Result<Option<ApprovalChain>, ApplicationError> {
        let candidates = self.chains.list_active(entity_type).await?;
        let selector = ChainSelector::new(candidates);
        Ok(selector.select(entity_type, attributes).cloned())
    }

    pub async fn start_progress(
        &self,
        chain: &ApprovalChain,
        entity_id: &str,
        submitted_by: &str,
        context: &AuditContext,
    ) -> Result<ApprovalProgress, ApplicationError> {
        let progress = self.evaluator.start(chain, entity_id, submitted_by, Utc::now())?;

        if !self.progress.insert(progress.clone()).await? {
            warn!(
                event_name = "approval.progress.duplicate",
                correlation_id = %context.correlation_id,
                entity_type = chain.entity_type.as_str(),
                entity_id = %entity_id,
                "entity already has an open approval progress"
            );
            return Err(ApprovalError::DuplicateProgress {
                entity_type: chain.entity_type,
                entity_id: entity_id.to_string(),
            }
            .into());
        }

        info!(
            event_name = "approval.progress.started",
            correlation_id = %context.correlation_id,
            progress_id = %progress.id.0,
            chain_id = %chain.id.0,
            entity_type = chain.entity_type.as_str(),
            entity_id = %entity_id,
            "approval progress started"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(progress.id.clone()),
                context.correlation_id.clone(),
                "approval.progress_started",
                AuditCategory::Approval,
                context.actor.clone(),
                AuditOutcome::Success,
            )
            .with_metadata("chain_id", chain.id.0.clone())
            .with_metadata("entity_type", chain.entity_type.as_str())
            .with_metadata("entity_id", entity_id),
        );
        self.notify(ApprovalNotification::for_progress(
            NotificationKind::Submitted,
            &progress,
            chain.first_step().map(|step| step.approver.clone()),
            context.correlation_id.clone(),
        ));

        Ok(progress)
    }

    /// Selects the governing chain for a new entity and opens its progress.
    pub async fn submit(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        attributes: &EntityAttributes,
        submitted_by: &str,
        context: &AuditContext,
    ) -> Result<ApprovalProgress, ApplicationError> {
        let chain = self
            .select_chain(entity_type, attributes)
            .await?
            .ok_or(ApprovalError::NoMatchingChain { entity_type })?;

        debug!(
            event_name = "approval.chain.selected",
            correlation_id = %context.correlation_id,
            chain_id = %chain.id.0,
            entity_id = %entity_id,
            "approval chain selected"
        );
        self.start_progress(&chain, entity_id, submitted_by, context).await
    }

    pub async fn record_decision(
        &self,
        progress_id: &ProgressId,
        input: &DecisionInput,
        context: &AuditContext,
    ) -> Result<DecisionOutcome, ApplicationError> {
        for attempt in 1..=self.max_write_attempts {
            let current = self.load_progress(progress_id).await?;
            let chain = self.load_chain(&current.chain_id).await?;

            let outcome = match self.evaluator.record(&chain, &current, input, Utc::now()) {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.decision_refused(progress_id, input, context, &error);
                    return Err(error.into());
                }
            };

            if self.progress.compare_and_swap(outcome.progress.clone(), current.version).await? {
                self.decision_committed(&chain, &outcome, input, context);
                return Ok(outcome);
            }

            debug!(
                event_name = "approval.decision.retry",
                correlation_id = %context.correlation_id,
                progress_id = %progress_id.0,
                attempt,
                "progress changed concurrently, re-evaluating"
            );
        }

        warn!(
            event_name = "approval.decision.contended",
            correlation_id = %context.correlation_id,
            progress_id = %progress_id.0,
            attempts = self.max_write_attempts,
            "decision abandoned after repeated write conflicts"
        );
        Err(ApplicationError::Persistence(format!(
            "progress `{}` kept changing; gave up after {} attempts",
            progress_id.0, self.max_write_attempts
        )))
    }

    pub async fn find_progress(
        &self,
        id: &ProgressId,
    ) -> Result<Option<ApprovalProgress>, ApplicationError> {
        Ok(self.progress.find_by_id(id).await?)
    }

    pub async fn find_open_progress_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ApprovalProgress>, ApplicationError> {
        Ok(self.progress.find_open_for_entity(entity_type, entity_id).await?)
    }

    /// Pending progress whose current step `identity` may still act on, oldest first.
    pub async fn list_pending_for_approver(
        &self,
        identity: &ApproverIdentity,
        limit: usize,
    ) -> Result<Vec<ApprovalProgress>, ApplicationError> {
        let mut chains: HashMap<String, Option<ApprovalChain>> = HashMap::new();
        let mut actionable = Vec::new();

        for progress in self.progress.list_pending().await? {
            if actionable.len() >= limit {
                break;
            }
            let Some(step_order) = progress.current_step else {
                continue;
            };

            if !chains.contains_key(&progress.chain_id.0) {
                let chain = self.chains.find_by_id(&progress.chain_id).await?;
                chains.insert(progress.chain_id.0.clone(), chain);
            }
            let Some(Some(chain)) = chains.get(&progress.chain_id.0) else {
                continue;
            };
            let Some(step) = chain.step(step_order) else {
                continue;
            };

            if identity.may_act_on(&step.approver)
                && !progress.has_decided(step_order, &identity.user_id)
            {
                actionable.push(progress);
            }
        }

        Ok(actionable)
    }

    /// Normalizes step order, validates, then upserts.
    pub async fn save_chain(
        &self,
        chain: ApprovalChain,
    ) -> Result<ApprovalChain, ApplicationError> {
        let mut saved = self.save_chains(vec![chain]).await?;
        saved.pop().ok_or_else(|| ApplicationError::Persistence("no chain was saved".to_owned()))
    }

    /// Saves every chain or none of them.
    ///
    /// A chain that pending progress points at keeps its steps: a save that
    /// changes them is refused with [`ApprovalError::ChainInUse`].
    pub async fn save_chains(
        &self,
        chains: Vec<ApprovalChain>,
    ) -> Result<Vec<ApprovalChain>, ApplicationError> {
        let chains: Vec<ApprovalChain> =
            chains.into_iter().map(ApprovalChain::with_sorted_steps).collect();
        for chain in &chains {
            chain.validate().map_err(ApprovalError::from)?;
        }

        let mut pending_by_chain: HashMap<String, usize> = HashMap::new();
        for progress in self.progress.list_pending().await? {
            *pending_by_chain.entry(progress.chain_id.0).or_default() += 1;
        }
        for chain in &chains {
            let Some(&pending) = pending_by_chain.get(&chain.id.0) else {
                continue;
            };
            if let Some(stored) = self.chains.find_by_id(&chain.id).await? {
                if stored.steps != chain.steps {
                    warn!(
                        event_name = "approval.chain.save_refused",
                        chain_id = %chain.id.0,
                        pending,
                        "chain steps changed while progress is pending"
                    );
                    let chain_id = chain.id.0.clone();
                    return Err(ApprovalError::ChainInUse { chain_id, pending }.into());
                }
            }
        }

        self.chains.save_all(chains.clone()).await?;
        for chain in &chains {
            info!(
                event_name = "approval.chain.saved",
                chain_id = %chain.id.0,
                entity_type = chain.entity_type.as_str(),
                steps = chain.steps.len(),
                "approval chain saved"
            );
        }
        Ok(chains)
    }

    pub async fn find_chain(
        &self,
        id: &ChainId,
    ) -> Result<Option<ApprovalChain>, ApplicationError> {
        Ok(self.chains.find_by_id(id).await?)
    }

    pub async fn list_chains(&self) -> Result<Vec<ApprovalChain>, ApplicationError> {
        Ok(self.chains.list_all().await?)
    }

    /// Existing progress keeps running on a deactivated chain; only selection stops.
    pub async fn deactivate_chain(&self, id: &ChainId) -> Result<(), ApplicationError> {
        if !self.chains.set_active(id, false).await? {
            return Err(ApplicationError::NotFound(format!("approval chain `{}`", id.0)));
        }
        info!(event_name = "approval.chain.deactivated", chain_id = %id.0, "chain deactivated");
        Ok(())
    }

    pub async fn coverage_gaps(&self) -> Result<Vec<EntityType>, ApplicationError> {
        let chains = self.chains.list_all().await?;
        Ok(ChainSelector::new(chains).coverage_gaps())
    }

    async fn load_progress(&self, id: &ProgressId) -> Result<ApprovalProgress, ApplicationError> {
        self.progress
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("approval progress `{}`", id.0)))
    }

    async fn load_chain(&self, id: &ChainId) -> Result<ApprovalChain, ApplicationError> {
        self.chains
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("approval chain `{}`", id.0)))
    }

    fn decision_refused(
        &self,
        progress_id: &ProgressId,
        input: &DecisionInput,
        context: &AuditContext,
        error: &ApprovalError,
    ) {
        info!(
            event_name = "approval.decision.refused",
            correlation_id = %context.correlation_id,
            progress_id = %progress_id.0,
            approver_id = %input.approver.user_id,
            step = input.step_order,
            error = %error,
            "approval decision refused"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(progress_id.clone()),
                context.correlation_id.clone(),
                "approval.decision_rejected",
                AuditCategory::Approval,
                context.actor.clone(),
                AuditOutcome::Rejected,
            )
            .with_metadata("approver_id", input.approver.user_id.clone())
            .with_metadata("step", input.step_order.to_string())
            .with_metadata("reason", error.to_string()),
        );
    }

    fn decision_committed(
        &self,
        chain: &ApprovalChain,
        outcome: &DecisionOutcome,
        input: &DecisionInput,
        context: &AuditContext,
    ) {
        let progress = &outcome.progress;
        info!(
            event_name = "approval.decision.recorded",
            correlation_id = %context.correlation_id,
            progress_id = %progress.id.0,
            approver_id = %input.approver.user_id,
            decision = input.decision.as_str(),
            transition = outcome.transition.name(),
            status = progress.status.as_str(),
            "approval decision recorded"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(progress.id.clone()),
                context.correlation_id.clone(),
                "approval.decision_recorded",
                AuditCategory::Approval,
                context.actor.clone(),
                AuditOutcome::Success,
            )
            .with_metadata("approver_id", input.approver.user_id.clone())
            .with_metadata("decision", input.decision.as_str())
            .with_metadata("transition", outcome.transition.name())
            .with_metadata("version", progress.version.to_string()),
        );

        let notification = match &outcome.transition {
            ProgressTransition::PartialApproval { .. } => None,
            ProgressTransition::StepAdvanced { to, .. } => Some((
                NotificationKind::StepAdvanced,
                chain.step(*to).map(|step| step.approver.clone()),
            )),
            ProgressTransition::Approved { .. } => Some((NotificationKind::Approved, None)),
            ProgressTransition::Rejected { .. } => Some((NotificationKind::Rejected, None)),
        };
        if let Some((kind, next_approver)) = notification {
            self.notify(ApprovalNotification::for_progress(
                kind,
                progress,
                next_approver,
                context.correlation_id.clone(),
            ));
        }
    }

    fn notify(&self, notification: ApprovalNotification) {
        if !self.notifications_enabled {
            return;
        }
        let notifier = Arc::clone(&self.notifier);

        tokio::spawn(async move {
            let kind = notification.kind;
            let progress_id = notification.progress_id.0.clone();
            let correlation_id = notification.correlation_id.clone();
            if let Err(error) = notifier.dispatch(notification).await {
                warn!(
                    event_name = "approval.notification.failed",
                    correlation_id = %correlation_id,
                    progress_id = %progress_id,
                    kind = kind.as_str(),
                    error = %error,
                    "approval notification failed"
                );
            }
        });
    }
}

/// Forwards notifications onto an unbounded channel for an embedding process to drain.
#[derive(Clone)]
pub struct ChannelNotificationDispatcher {
    sender: mpsc::UnboundedSender<ApprovalNotification>,
}

impl ChannelNotificationDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ApprovalNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl NotificationDispatcher for ChannelNotificationDispatcher {
    async fn dispatch(&self, notification: ApprovalNotification) -> Result<(), NotificationError> {
        self.sender.send(notification).map_err(|_| NotificationError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use wrkspace_core::approvals::{
        ApprovalError, ApprovalEvaluator, ApproverIdentity, DecisionInput, ProgressTransition,
    };
    use wrkspace_core::audit::{AuditContext, AuditOutcome, InMemoryAuditSink};
    use wrkspace_core::config::AppConfig;
    use wrkspace_core::domain::approval::{
        ApprovalChain, ApprovalProgress, ApproverSpec, ChainConditions, ChainId, ChainStep,
        Decision, EntityAttributes, EntityType, ProgressId, ProgressStatus,
    };
    use wrkspace_core::errors::ApplicationError;
    use wrkspace_core::notifications::NotificationKind;

    use super::{ApprovalService, ChannelNotificationDispatcher};
    use crate::repositories::{
        ChainRepository, InMemoryChainRepository, InMemoryProgressRepository, ProgressRepository,
        RepositoryError,
    };
    use crate::{connect_and_migrate, DbPool};

    fn ctx() -> AuditContext {
        AuditContext::new("req-test", "u-tester")
    }

    fn role_step(order: u32, role: &str, required_approvals: u32) -> ChainStep {
        ChainStep { order, approver: ApproverSpec::Role(role.to_string()), required_approvals }
    }

    fn chain(id: &str, entity_type: EntityType, steps: Vec<ChainStep>) -> ApprovalChain {
        let now = Utc::now();
        ApprovalChain {
            id: ChainId(id.to_string()),
            name: format!("{id} chain"),
            entity_type,
            steps,
            conditions: ChainConditions::default(),
            priority: 100,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn manager_then_hr() -> ApprovalChain {
        chain(
            "leave-standard",
            EntityType::Leave,
            vec![role_step(1, "manager", 1), role_step(2, "hr", 1)],
        )
    }

    fn approve(step_order: u32, user_id: &str, role: &str) -> DecisionInput {
        DecisionInput {
            step_order,
            approver: ApproverIdentity::new(user_id, vec![role.to_string()]),
            decision: Decision::Approve,
            comment: None,
        }
    }

    fn reject(step_order: u32, user_id: &str, role: &str) -> DecisionInput {
        DecisionInput { decision: Decision::Reject, ..approve(step_order, user_id, role) }
    }

    async fn in_memory_with(chains: Vec<ApprovalChain>) -> ApprovalService {
        let chain_repo = Arc::new(InMemoryChainRepository::default());
        for chain in chains {
            chain_repo.save(chain).await.expect("seed chain");
        }
        ApprovalService::new(chain_repo, Arc::new(InMemoryProgressRepository::default()))
    }

    async fn sql_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("approvals.db").display());
        let pool = connect_and_migrate(&url, 4, 30).await.expect("connect");
        (dir, pool)
    }

    fn approval_error(result: Result<impl std::fmt::Debug, ApplicationError>) -> ApprovalError {
        match result {
            Err(error) => error.approval().cloned().expect("approval error"),
            Ok(value) => panic!("expected approval error, got {value:?}"),
        }
    }

    #[tokio::test]
    async fn manager_then_hr_end_to_end() {
        let service = in_memory_with(vec![manager_then_hr()]).await;
        let progress = service
            .start_progress(&manager_then_hr(), "LV-100", "u-employee", &ctx())
            .await
            .expect("start");
        assert_eq!(progress.current_step, Some(1));
        assert_eq!(progress.status, ProgressStatus::Pending);

        let after_manager = service
            .record_decision(&progress.id, &approve(1, "u-manager", "manager"), &ctx())
            .await
            .expect("manager approves");
        assert_eq!(after_manager.transition, ProgressTransition::StepAdvanced { from: 1, to: 2 });
        assert_eq!(after_manager.progress.current_step, Some(2));
        assert_eq!(after_manager.progress.status, ProgressStatus::Pending);

        let after_hr = service
            .record_decision(&progress.id, &approve(2, "u-hr", "HR"), &ctx())
            .await
            .expect("hr approves");
        assert_eq!(after_hr.progress.status, ProgressStatus::Approved);
        assert!(after_hr.progress.completed_at.is_some());

        let stored = service.find_progress(&progress.id).await.expect("find").expect("exists");
        assert_eq!(stored, after_hr.progress);
    }

    #[tokio::test]
    async fn submit_selects_min_amount_chain_for_large_expense() {
        let mut small = chain("small", EntityType::Expense, vec![role_step(1, "manager", 1)]);
        small.conditions.max_amount = Some(Decimal::new(1_000, 0));
        let mut large = chain("large", EntityType::Expense, vec![role_step(1, "finance", 1)]);
        large.conditions.min_amount = Some(Decimal::new(1_000, 0));
        let service = in_memory_with(vec![small, large]).await;

        let attributes = EntityAttributes {
            amount: Some(Decimal::new(5_000, 0)),
            ..EntityAttributes::default()
        };
        let progress = service
            .submit(EntityType::Expense, "EXP-1", &attributes, "u-employee", &ctx())
            .await
            .expect("submit");

        assert_eq!(progress.chain_id.0, "large");
    }

    #[tokio::test]
    async fn submit_without_matching_chain_fails_explicitly() {
        let service = in_memory_with(vec![manager_then_hr()]).await;

        let error = approval_error(
            service
                .submit(EntityType::Expense, "EXP-1", &EntityAttributes::default(), "u-e", &ctx())
                .await,
        );
        assert_eq!(error, ApprovalError::NoMatchingChain { entity_type: EntityType::Expense });
    }

    #[tokio::test]
    async fn second_start_for_open_entity_is_duplicate() {
        let service = in_memory_with(vec![manager_then_hr()]).await;
        service
            .start_progress(&manager_then_hr(), "LV-1", "u-employee", &ctx())
            .await
            .expect("first start");

        let error = approval_error(
            service.start_progress(&manager_then_hr(), "LV-1", "u-employee", &ctx()).await,
        );
        assert!(matches!(error, ApprovalError::DuplicateProgress { .. }));
    }

    #[tokio::test]
    async fn reject_is_terminal_and_later_decisions_are_not_pending() {
        let service = in_memory_with(vec![manager_then_hr()]).await;
        let progress = service
            .start_progress(&manager_then_hr(), "LV-2", "u-employee", &ctx())
            .await
            .expect("start");

        let outcome = service
            .record_decision(&progress.id, &reject(1, "u-manager", "manager"), &ctx())
            .await
            .expect("reject");
        assert_eq!(outcome.progress.status, ProgressStatus::Rejected);
        assert_eq!(outcome.progress.step_decisions.len(), 1);

        let error = approval_error(
            service.record_decision(&progress.id, &approve(1, "u-other", "manager"), &ctx()).await,
        );
        assert!(matches!(error, ApprovalError::NotPending { .. }));

        let stored = service.find_progress(&progress.id).await.expect("find").expect("exists");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn failed_decision_leaves_progress_untouched() {
        let service = in_memory_with(vec![manager_then_hr()]).await;
        let progress = service
            .start_progress(&manager_then_hr(), "LV-3", "u-employee", &ctx())
            .await
            .expect("start");

        let error = approval_error(
            service.record_decision(&progress.id, &approve(1, "u-hr", "hr"), &ctx()).await,
        );
        assert!(matches!(error, ApprovalError::UnauthorizedApprover { .. }));

        let stored = service.find_progress(&progress.id).await.expect("find").expect("exists");
        assert_eq!(stored, progress);
    }

    #[tokio::test]
    async fn unknown_progress_is_not_found() {
        let service = in_memory_with(vec![]).await;
        let result = service
            .record_decision(
                &ProgressId("missing".to_string()),
                &approve(1, "u-manager", "manager"),
                &ctx(),
            )
            .await;
        assert!(matches!(result, Err(ApplicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn pending_queue_only_lists_actionable_steps() {
        let service = in_memory_with(vec![manager_then_hr()]).await;
        let first = service
            .start_progress(&manager_then_hr(), "LV-10", "u-employee", &ctx())
            .await
            .expect("start first");
        let second = service
            .start_progress(&manager_then_hr(), "LV-11", "u-employee", &ctx())
            .await
            .expect("start second");
        service
            .record_decision(&second.id, &approve(1, "u-manager", "manager"), &ctx())
            .await
            .expect("advance second");

        let manager = ApproverIdentity::new("u-manager", vec!["manager".to_string()]);
        let hr = ApproverIdentity::new("u-hr", vec!["hr".to_string()]);

        let for_manager = service.list_pending_for_approver(&manager, 10).await.expect("manager");
        let for_hr = service.list_pending_for_approver(&hr, 10).await.expect("hr");
        assert_eq!(for_manager.iter().map(|p| &p.id).collect::<Vec<_>>(), vec![&first.id]);
        assert_eq!(for_hr.iter().map(|p| &p.id).collect::<Vec<_>>(), vec![&second.id]);
        assert!(service.list_pending_for_approver(&hr, 0).await.expect("limit").is_empty());
    }

    #[tokio::test]
    async fn save_chain_validates_and_sorts_steps() {
        let service = in_memory_with(vec![]).await;

        let saved = service
            .save_chain(chain(
                "unsorted",
                EntityType::Request,
                vec![role_step(2, "hr", 1), role_step(1, "manager", 1)],
            ))
            .await
            .expect("save");
        assert_eq!(saved.steps.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1, 2]);

        let error = approval_error(
            service.save_chain(chain("empty", EntityType::Request, Vec::new())).await,
        );
        assert!(matches!(error, ApprovalError::Validation(_)));
    }

    #[tokio::test]
    async fn steps_of_chain_with_pending_progress_cannot_change() {
        let two_steps = || {
            chain(
                "committee",
                EntityType::Request,
                vec![role_step(1, "board", 3), role_step(2, "hr", 1)],
            )
        };
        let service = in_memory_with(vec![two_steps()]).await;
        let progress = service
            .start_progress(&two_steps(), "REQ-1", "u-employee", &ctx())
            .await
            .expect("start");
        service
            .record_decision(&progress.id, &approve(1, "u-a", "board"), &ctx())
            .await
            .expect("first board approval");

        let mut relaxed = two_steps();
        relaxed.steps[0].required_approvals = 1;
        let error = approval_error(service.save_chain(relaxed).await);
        assert_eq!(
            error,
            ApprovalError::ChainInUse { chain_id: "committee".to_string(), pending: 1 }
        );

        let renumbered = chain(
            "committee",
            EntityType::Request,
            vec![role_step(10, "board", 3), role_step(20, "hr", 1)],
        );
        let error = approval_error(service.save_chain(renumbered).await);
        assert!(matches!(error, ApprovalError::ChainInUse { .. }));

        let stored = service
            .find_chain(&ChainId("committee".to_string()))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(stored.steps, two_steps().steps);

        let after = service
            .record_decision(&progress.id, &approve(1, "u-b", "board"), &ctx())
            .await
            .expect("second board approval");
        assert_eq!(
            after.transition,
            ProgressTransition::PartialApproval { step: 1, approvals: 2, required: 3 }
        );
    }

    #[tokio::test]
    async fn chain_in_use_accepts_changes_that_keep_steps() {
        let service = in_memory_with(vec![manager_then_hr()]).await;
        let progress = service
            .start_progress(&manager_then_hr(), "LV-1", "u-employee", &ctx())
            .await
            .expect("start");

        let mut renamed = manager_then_hr();
        renamed.name = "Leave (renamed)".to_string();
        renamed.priority = 5;
        renamed.steps.reverse();
        let saved = service.save_chain(renamed).await.expect("rename keeps steps");
        assert_eq!(saved.name, "Leave (renamed)");

        service
            .record_decision(&progress.id, &reject(1, "u-manager", "manager"), &ctx())
            .await
            .expect("reject");

        let mut single = manager_then_hr();
        single.steps.truncate(1);
        let saved = service.save_chain(single).await.expect("no pending progress left");
        assert_eq!(saved.steps.len(), 1);
    }

    #[tokio::test]
    async fn refused_chain_save_leaves_whole_batch_unsaved() {
        let service = in_memory_with(vec![manager_then_hr()]).await;
        service
            .start_progress(&manager_then_hr(), "LV-2", "u-employee", &ctx())
            .await
            .expect("start");

        let fresh = chain("request-any", EntityType::Request, vec![role_step(1, "hr", 1)]);
        let mut changed = manager_then_hr();
        changed.steps[1].required_approvals = 2;

        let error = approval_error(service.save_chains(vec![fresh, changed]).await);
        assert!(matches!(error, ApprovalError::ChainInUse { .. }));
        assert!(service
            .find_chain(&ChainId("request-any".to_string()))
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn coverage_gaps_follow_deactivation() {
        let service = in_memory_with(vec![
            chain("expense-any", EntityType::Expense, vec![role_step(1, "manager", 1)]),
            chain("leave-any", EntityType::Leave, vec![role_step(1, "manager", 1)]),
            chain("request-any", EntityType::Request, vec![role_step(1, "hr", 1)]),
        ])
        .await;
        assert!(service.coverage_gaps().await.expect("gaps").is_empty());

        service.deactivate_chain(&ChainId("leave-any".to_string())).await.expect("deactivate");
        assert_eq!(service.coverage_gaps().await.expect("gaps"), vec![EntityType::Leave]);

        let missing = service.deactivate_chain(&ChainId("nope".to_string())).await;
        assert!(matches!(missing, Err(ApplicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn audit_sink_records_start_decision_and_refusal() {
        let audit = InMemoryAuditSink::default();
        let service =
            in_memory_with(vec![manager_then_hr()]).await.with_audit_sink(Arc::new(audit.clone()));
        let progress = service
            .start_progress(&manager_then_hr(), "LV-20", "u-employee", &ctx())
            .await
            .expect("start");
        service
            .record_decision(&progress.id, &approve(1, "u-manager", "manager"), &ctx())
            .await
            .expect("approve");
        let _ = service
            .record_decision(&progress.id, &approve(1, "u-manager", "manager"), &ctx())
            .await;

        let events = audit.events();
        let types: Vec<&str> = events.iter().map(|event| event.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "approval.progress_started",
                "approval.decision_recorded",
                "approval.decision_rejected",
            ]
        );
        assert_eq!(events[2].outcome, AuditOutcome::Rejected);
        assert!(events.iter().all(|event| event.correlation_id == "req-test"));
    }

    #[tokio::test]
    async fn notifications_follow_each_transition() {
        let (dispatcher, mut receiver) = ChannelNotificationDispatcher::channel();
        let service =
            in_memory_with(vec![manager_then_hr()]).await.with_notifier(Arc::new(dispatcher));
        let progress = service
            .start_progress(&manager_then_hr(), "LV-30", "u-employee", &ctx())
            .await
            .expect("start");
        service
            .record_decision(&progress.id, &approve(1, "u-manager", "manager"), &ctx())
            .await
            .expect("manager");
        service
            .record_decision(&progress.id, &approve(2, "u-hr", "hr"), &ctx())
            .await
            .expect("hr");

        let mut received = Vec::new();
        for _ in 0..3 {
            let notification = tokio::time::timeout(StdDuration::from_secs(2), receiver.recv())
                .await
                .expect("notification in time")
                .expect("channel open");
            received.push(notification);
        }
        let mut kinds: Vec<&str> = received.iter().map(|n| n.kind.as_str()).collect();
        kinds.sort_unstable();
        assert_eq!(kinds, vec!["approved", "step_advanced", "submitted"]);

        let advanced = received
            .iter()
            .find(|n| n.kind == NotificationKind::StepAdvanced)
            .expect("step advanced notification");
        assert_eq!(advanced.next_approver, Some(ApproverSpec::Role("hr".to_string())));
        assert!(received.iter().all(|n| n.submitted_by == "u-employee"));
    }

    #[tokio::test]
    async fn closed_notification_channel_does_not_fail_decision() {
        let (dispatcher, receiver) = ChannelNotificationDispatcher::channel();
        drop(receiver);
        let service =
            in_memory_with(vec![manager_then_hr()]).await.with_notifier(Arc::new(dispatcher));

        let progress = service
            .start_progress(&manager_then_hr(), "LV-31", "u-employee", &ctx())
            .await
            .expect("start despite closed channel");
        service
            .record_decision(&progress.id, &approve(1, "u-manager", "manager"), &ctx())
            .await
            .expect("decision despite closed channel");
    }

    #[tokio::test]
    async fn disabled_notifications_in_config_skip_dispatch() {
        let (dispatcher, mut receiver) = ChannelNotificationDispatcher::channel();
        let mut config = AppConfig::default();
        config.approvals.notifications_enabled = false;
        let service = in_memory_with(vec![manager_then_hr()])
            .await
            .with_notifier(Arc::new(dispatcher))
            .with_config(&config.approvals);

        service
            .start_progress(&manager_then_hr(), "LV-32", "u-employee", &ctx())
            .await
            .expect("start");
        tokio::task::yield_now().await;
        assert!(receiver.try_recv().is_err());
    }

    /// Applies a competing write right before the service's own swap, as if
    /// another request committed between our read and our write.
    struct InterleavingProgressRepository {
        inner: InMemoryProgressRepository,
        competing: Mutex<Option<ApprovalProgress>>,
    }

    #[async_trait::async_trait]
    impl ProgressRepository for InterleavingProgressRepository {
        async fn find_by_id(
            &self,
            id: &ProgressId,
        ) -> Result<Option<ApprovalProgress>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn find_open_for_entity(
            &self,
            entity_type: EntityType,
            entity_id: &str,
        ) -> Result<Option<ApprovalProgress>, RepositoryError> {
            self.inner.find_open_for_entity(entity_type, entity_id).await
        }

        async fn insert(&self, progress: ApprovalProgress) -> Result<bool, RepositoryError> {
            self.inner.insert(progress).await
        }

        async fn compare_and_swap(
            &self,
            progress: ApprovalProgress,
            expected_version: u32,
        ) -> Result<bool, RepositoryError> {
            let competing = self.competing.lock().expect("lock").take();
            if let Some(competing) = competing {
                assert!(self.inner.compare_and_swap(competing, expected_version).await?);
            }
            self.inner.compare_and_swap(progress, expected_version).await
        }

        async fn list_pending(&self) -> Result<Vec<ApprovalProgress>, RepositoryError> {
            self.inner.list_pending().await
        }
    }

    async fn interleaved(
        chain: ApprovalChain,
        competitor: DecisionInput,
    ) -> (ApprovalService, ProgressId) {
        let chain_repo = Arc::new(InMemoryChainRepository::default());
        chain_repo.save(chain.clone()).await.expect("seed chain");

        let progress = ApprovalEvaluator::new()
            .start(&chain, "REQ-1", "u-employee", Utc::now())
            .expect("start");
        let competing = ApprovalEvaluator::new()
            .record(&chain, &progress, &competitor, Utc::now())
            .expect("competing decision")
            .progress;

        let progress_repo = Arc::new(InterleavingProgressRepository {
            inner: InMemoryProgressRepository::default(),
            competing: Mutex::new(Some(competing)),
        });
        progress_repo.insert(progress.clone()).await.expect("insert");

        (ApprovalService::new(chain_repo, progress_repo), progress.id)
    }

    #[tokio::test]
    async fn lost_race_reevaluates_against_fresh_state() {
        let chain = chain(
            "two-step",
            EntityType::Request,
            vec![role_step(1, "manager", 1), role_step(2, "hr", 1)],
        );
        let (service, progress_id) =
            interleaved(chain, approve(1, "u-manager-a", "manager")).await;

        let error = approval_error(
            service
                .record_decision(&progress_id, &approve(1, "u-manager-b", "manager"), &ctx())
                .await,
        );
        assert_eq!(error, ApprovalError::WrongStep { expected: Some(2), submitted: 1 });

        let stored = service.find_progress(&progress_id).await.expect("find").expect("exists");
        assert_eq!(stored.approvals_at(1), 1);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn lost_race_by_same_approver_is_duplicate_not_double_count() {
        let chain = chain("pair", EntityType::Request, vec![role_step(1, "manager", 2)]);
        let (service, progress_id) = interleaved(chain, approve(1, "u-manager", "manager")).await;

        let error = approval_error(
            service
                .record_decision(&progress_id, &approve(1, "u-manager", "manager"), &ctx())
                .await,
        );
        assert!(matches!(error, ApprovalError::DuplicateApproval { .. }));

        let stored = service.find_progress(&progress_id).await.expect("find").expect("exists");
        assert_eq!(stored.approvals_at(1), 1);
        assert_eq!(stored.status, ProgressStatus::Pending);
    }

    #[tokio::test]
    async fn lost_race_on_partial_step_still_counts_both_distinct_approvers() {
        let chain = chain("pair", EntityType::Request, vec![role_step(1, "manager", 2)]);
        let (service, progress_id) = interleaved(chain, approve(1, "u-manager-a", "manager")).await;

        let outcome = service
            .record_decision(&progress_id, &approve(1, "u-manager-b", "manager"), &ctx())
            .await
            .expect("retry succeeds");
        assert_eq!(outcome.progress.status, ProgressStatus::Approved);
        assert_eq!(outcome.progress.approvals_at(1), 2);
        assert_eq!(outcome.progress.version, 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_as_persistence_error() {
        let chain = chain("pair", EntityType::Request, vec![role_step(1, "manager", 2)]);
        let (service, progress_id) = interleaved(chain, approve(1, "u-manager-a", "manager")).await;
        let service = service.with_max_write_attempts(1);

        let result = service
            .record_decision(&progress_id, &approve(1, "u-manager-b", "manager"), &ctx())
            .await;
        assert!(matches!(result, Err(ApplicationError::Persistence(_))));
    }

    async fn race_single_approval_step(service: Arc<ApprovalService>, chain: ApprovalChain) {
        service.save_chain(chain.clone()).await.expect("save chain");
        let progress = service
            .start_progress(&chain, "REQ-RACE", "u-employee", &ctx())
            .await
            .expect("start");

        let mut handles = Vec::new();
        for approver in ["u-manager-a", "u-manager-b", "u-manager-c", "u-manager-d"] {
            let service = Arc::clone(&service);
            let progress_id = progress.id.clone();
            handles.push(tokio::spawn(async move {
                let input = approve(1, approver, "manager");
                service.record_decision(&progress_id, &input, &ctx()).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => successes += 1,
                Err(error) => assert!(matches!(
                    error.approval(),
                    Some(ApprovalError::WrongStep { .. } | ApprovalError::NotPending { .. })
                )),
            }
        }
        assert_eq!(successes, 1);

        let stored = service.find_progress(&progress.id).await.expect("find").expect("exists");
        assert_eq!(stored.approvals_at(1), 1);
        assert_eq!(stored.current_step, Some(2));
    }

    fn race_chain() -> ApprovalChain {
        chain("race", EntityType::Request, vec![role_step(1, "manager", 1), role_step(2, "hr", 1)])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_decisions_in_memory_never_overcount() {
        let service = Arc::new(in_memory_with(Vec::new()).await.with_max_write_attempts(16));
        race_single_approval_step(service, race_chain()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_decisions_in_sqlite_never_overcount() {
        let (_dir, pool) = sql_pool().await;
        let service = Arc::new(ApprovalService::sql(pool).with_max_write_attempts(16));
        race_single_approval_step(service, race_chain()).await;
    }

    #[tokio::test]
    async fn sqlite_service_runs_full_flow() {
        let (_dir, pool) = sql_pool().await;
        let service = ApprovalService::sql(pool);
        let mut older = manager_then_hr();
        older.created_at = Utc::now() - Duration::days(3);
        service.save_chain(older).await.expect("save chain");

        let attributes =
            EntityAttributes { days: Some(Decimal::new(3, 0)), ..EntityAttributes::default() };
        let progress = service
            .submit(EntityType::Leave, "LV-SQL", &attributes, "u-employee", &ctx())
            .await
            .expect("submit");
        service
            .record_decision(&progress.id, &approve(1, "u-manager", "manager"), &ctx())
            .await
            .expect("manager");
        let outcome = service
            .record_decision(&progress.id, &approve(2, "u-hr", "hr"), &ctx())
            .await
            .expect("hr");

        assert_eq!(outcome.progress.status, ProgressStatus::Approved);
        let open = service
            .find_open_progress_for_entity(EntityType::Leave, "LV-SQL")
            .await
            .expect("lookup");
        assert!(open.is_none());
        let stored = service.find_progress(&progress.id).await.expect("find").expect("exists");
        assert_eq!(stored.step_decisions.len(), 2);
    }
}
