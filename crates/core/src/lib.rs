pub mod approvals;
pub mod audit;
pub mod chain_file;
pub mod config;
pub mod domain;
pub mod errors;
pub mod notifications;

pub use approvals::{
    ApprovalError, ApprovalEvaluator, ApproverIdentity, ChainSelector, DecisionInput,
    DecisionOutcome, ProgressTransition,
};
pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use chain_file::{ChainDefinition, ChainFile, ChainFileError};
pub use domain::approval::{
    ApprovalChain, ApprovalProgress, ApproverSpec, ChainConditions, ChainId, ChainStep,
    ChainValidationError, Decision, EntityAttributes, EntityType, ProgressId, ProgressStatus,
    StepDecision,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use notifications::{
    ApprovalNotification, NotificationDispatcher, NotificationError, NotificationKind,
};

pub use chrono;
pub use rust_decimal;
