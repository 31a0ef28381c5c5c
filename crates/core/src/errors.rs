use thiserror::Error;

use crate::approvals::ApprovalError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<ApprovalError> for ApplicationError {
    fn from(value: ApprovalError) -> Self {
        Self::Domain(DomainError::Approval(value))
    }
}

impl ApplicationError {
    pub fn approval(&self) -> Option<&ApprovalError> {
        match self {
            Self::Domain(DomainError::Approval(error)) => Some(error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not allowed to act on this approval step.",
            Self::NotFound { .. } => "The requested approval could not be found.",
            Self::Conflict { .. } => {
                "The approval has changed since it was loaded. Refresh and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::Approval(error)) => {
                let message = error.to_string();
                match error {
                    ApprovalError::UnauthorizedApprover { .. } => {
                        Self::Forbidden { message, correlation_id }
                    }
                    ApprovalError::DuplicateProgress { .. }
                    | ApprovalError::NotPending { .. }
                    | ApprovalError::WrongStep { .. }
                    | ApprovalError::DuplicateApproval { .. }
                    | ApprovalError::ChainInUse { .. } => {
                        Self::Conflict { message, correlation_id }
                    }
                    ApprovalError::Validation(_)
                    | ApprovalError::ChainInactive { .. }
                    | ApprovalError::NoMatchingChain { .. }
                    | ApprovalError::ChainMismatch { .. }
                    | ApprovalError::UnknownStep { .. } => {
                        Self::BadRequest { message, correlation_id }
                    }
                }
            }
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::approvals::ApprovalError;
    use crate::domain::approval::{ChainValidationError, ProgressStatus};
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn validation_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(ApprovalError::Validation(
            ChainValidationError::NoSteps { chain_id: "chain-1".to_owned() },
        ))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn unauthorized_approver_maps_to_forbidden() {
        let interface = ApplicationError::from(ApprovalError::UnauthorizedApprover {
            approver_id: "u-1".to_owned(),
            step: 1,
            required: "role `hr`".to_owned(),
        })
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::Forbidden { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn stale_decisions_map_to_conflict() {
        let not_pending = ApplicationError::from(ApprovalError::NotPending {
            progress_id: "p-1".to_owned(),
            status: ProgressStatus::Approved,
        })
        .into_interface("req-3");
        let wrong_step = ApplicationError::from(ApprovalError::WrongStep {
            expected: Some(2),
            submitted: 1,
        })
        .into_interface("req-4");

        assert!(matches!(not_pending, InterfaceError::Conflict { .. }));
        assert!(matches!(wrong_step, InterfaceError::Conflict { .. }));
    }

    #[test]
    fn step_change_on_chain_in_use_maps_to_conflict() {
        let interface = ApplicationError::from(ApprovalError::ChainInUse {
            chain_id: "leave-standard".to_owned(),
            pending: 2,
        })
        .into_interface("req-6");

        assert!(matches!(interface, InterfaceError::Conflict { .. }));
        assert!(interface.to_string().contains("`leave-standard` has 2 pending"));
    }

    #[test]
    fn approval_accessor_unwraps_domain_layers() {
        let duplicate = ApprovalError::DuplicateApproval { approver_id: "u-1".to_owned(), step: 1 };
        let error = ApplicationError::Domain(DomainError::Approval(duplicate));

        assert!(matches!(error.approval(), Some(ApprovalError::DuplicateApproval { .. })));
        assert!(ApplicationError::Persistence("locked".to_owned()).approval().is_none());
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-5");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }
}
