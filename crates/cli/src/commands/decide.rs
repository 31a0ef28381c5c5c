use clap::Args;
use serde_json::json;
use wrkspace_core::approvals::{ApproverIdentity, DecisionInput};
use wrkspace_core::config::LoadOptions;
use wrkspace_core::domain::approval::{Decision, ProgressId};

use crate::commands::{
    application_failure, approval_service, audit_context, build_runtime, load_config, open_pool,
    to_json, CommandResult,
};

#[derive(Debug, Args)]
pub struct DecideArgs {
    #[arg(help = "Approval progress id")]
    pub progress_id: String,
    #[arg(long, help = "Step order the decision is for; must be the current step")]
    pub step: u32,
    #[arg(long, help = "User id of the deciding approver")]
    pub approver: String,
    #[arg(long = "role", help = "Role held by the approver (repeatable)")]
    pub roles: Vec<String>,
    #[arg(long, value_parser = crate::parse_decision, help = "approve | reject")]
    pub decision: Decision,
    #[arg(long)]
    pub comment: Option<String>,
}

impl DecideArgs {
    fn input(&self) -> DecisionInput {
        DecisionInput {
            step_order: self.step,
            approver: ApproverIdentity::new(self.approver.clone(), self.roles.clone()),
            decision: self.decision,
            comment: self.comment.clone(),
        }
    }
}

pub fn run(options: &LoadOptions, args: DecideArgs) -> CommandResult {
    let config = match load_config("decide", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("decide") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let context = audit_context(&args.approver);
    let progress_id = ProgressId(args.progress_id.clone());
    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let recorded = approval_service(pool.clone(), &config)
            .record_decision(&progress_id, &args.input(), &context)
            .await;
        pool.close().await;

        let outcome =
            recorded.map_err(|error| application_failure(error, &context.correlation_id))?;
        let data = json!({
            "progress": to_json(&outcome.progress)?,
            "transition": to_json(&outcome.transition)?,
        });
        Ok((outcome.progress.status, outcome.transition.name(), data))
    });

    match result {
        Ok((status, transition, data)) => CommandResult::success_with_data(
            "decide",
            format!(
                "{} recorded on progress `{}`: {transition} (status {})",
                args.decision.as_str(),
                progress_id.0,
                status.as_str()
            ),
            Some(data),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("decide", error_class, message, exit_code)
        }
    }
}
