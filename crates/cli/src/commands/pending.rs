use clap::Args;
use wrkspace_core::approvals::ApproverIdentity;
use wrkspace_core::config::LoadOptions;

use crate::commands::{
    application_failure, approval_service, build_runtime, correlation_id, load_config, open_pool,
    to_json, CommandResult,
};

#[derive(Debug, Args)]
pub struct PendingArgs {
    #[arg(long, help = "User id of the approver")]
    pub approver: String,
    #[arg(long = "role", help = "Role held by the approver (repeatable)")]
    pub roles: Vec<String>,
    #[arg(long, help = "Maximum rows returned; defaults to approvals.pending_page_size")]
    pub limit: Option<usize>,
}

pub fn run(options: &LoadOptions, args: PendingArgs) -> CommandResult {
    let config = match load_config("pending", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("pending") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let identity = ApproverIdentity::new(args.approver.clone(), args.roles.clone());
    let limit = args.limit.unwrap_or(config.approvals.pending_page_size as usize);
    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let listed = approval_service(pool.clone(), &config)
            .list_pending_for_approver(&identity, limit)
            .await;
        pool.close().await;

        let pending = listed.map_err(|error| application_failure(error, &correlation_id()))?;
        let data = to_json(&pending)?;
        Ok((pending.len(), data))
    });

    match result {
        Ok((count, data)) => CommandResult::success_with_data(
            "pending",
            format!("{count} approval(s) awaiting `{}`", identity.user_id),
            Some(data),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("pending", error_class, message, exit_code)
        }
    }
}
