use wrkspace_core::config::LoadOptions;
use wrkspace_core::domain::approval::ProgressId;
use wrkspace_core::errors::ApplicationError;

use crate::commands::{
    application_failure, approval_service, build_runtime, correlation_id, load_config, open_pool,
    to_json, CommandResult,
};

pub fn run(options: &LoadOptions, progress_id: &str) -> CommandResult {
    let config = match load_config("show", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("show") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let id = ProgressId(progress_id.to_string());
    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let found = approval_service(pool.clone(), &config).find_progress(&id).await;
        pool.close().await;

        let progress = found
            .and_then(|progress| {
                progress.ok_or_else(|| {
                    ApplicationError::NotFound(format!("approval progress `{progress_id}`"))
                })
            })
            .map_err(|error| application_failure(error, &correlation_id()))?;
        let data = to_json(&progress)?;
        Ok((progress, data))
    });

    match result {
        Ok((progress, data)) => {
            let step = progress
                .current_step
                .map(|step| format!(", current step {step}"))
                .unwrap_or_default();
            CommandResult::success_with_data(
                "show",
                format!("progress `{}` is {}{step}", progress.id.0, progress.status.as_str()),
                Some(data),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("show", error_class, message, exit_code)
        }
    }
}
