pub mod chains;
pub mod config;
pub mod decide;
pub mod doctor;
pub mod migrate;
pub mod pending;
pub mod seed;
pub mod show;
pub mod submit;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;
use wrkspace_core::audit::{AuditContext, AuditEvent, AuditSink};
use wrkspace_core::config::{AppConfig, LoadOptions};
use wrkspace_core::errors::{ApplicationError, InterfaceError};
use wrkspace_db::{connect_and_migrate, ApprovalService, ConnectError, DbPool};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_data(command, message, None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// `(error_class, message, exit_code)` carried out of a command's async block.
pub(crate) type CommandError = (&'static str, String, u8);

pub(crate) fn load_config(
    command: &str,
    options: &LoadOptions,
) -> Result<AppConfig, CommandResult> {
    AppConfig::load(options.clone()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

pub(crate) async fn open_pool(config: &AppConfig) -> Result<DbPool, CommandError> {
    connect_and_migrate(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| match error {
        ConnectError::Connect(_) => ("db_connectivity", error.to_string(), 4u8),
        ConnectError::Migrate(_) => ("migration", error.to_string(), 5u8),
    })
}

pub(crate) fn approval_service(pool: DbPool, config: &AppConfig) -> ApprovalService {
    ApprovalService::sql(pool)
        .with_config(&config.approvals)
        .with_audit_sink(Arc::new(LogAuditSink))
}

pub(crate) fn correlation_id() -> String {
    format!("cli-{}", Uuid::new_v4())
}

pub(crate) fn audit_context(actor: &str) -> AuditContext {
    AuditContext::new(correlation_id(), actor)
}

/// Maps service errors onto the interface classes and a stable exit code per class.
pub(crate) fn application_failure(error: ApplicationError, correlation_id: &str) -> CommandError {
    let interface = error.into_interface(correlation_id);
    let (error_class, exit_code) = match &interface {
        InterfaceError::BadRequest { .. } => ("bad_request", 7u8),
        InterfaceError::Forbidden { .. } => ("forbidden", 8),
        InterfaceError::NotFound { .. } => ("not_found", 9),
        InterfaceError::Conflict { .. } => ("conflict", 10),
        InterfaceError::ServiceUnavailable { .. } => ("service_unavailable", 11),
    };
    (error_class, format!("{interface} (correlation_id: {correlation_id})"), exit_code)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|error| ("serialization", error.to_string(), 12u8))
}

/// Writes audit events into the structured log stream.
struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = "audit.event",
            correlation_id = %event.correlation_id,
            progress_id = event.progress_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            audit_event_type = %event.event_type,
            actor = %event.actor,
            outcome = ?event.outcome,
            metadata = ?event.metadata,
            "audit event"
        );
    }
}
