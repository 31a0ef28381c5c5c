use clap::Args;
use rust_decimal::Decimal;
use wrkspace_core::config::LoadOptions;
use wrkspace_core::domain::approval::{EntityAttributes, EntityType};

use crate::commands::{
    application_failure, approval_service, audit_context, build_runtime, load_config, open_pool,
    to_json, CommandResult,
};

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(value_parser = crate::parse_entity_type, help = "expense | leave | request")]
    pub entity_type: EntityType,
    #[arg(help = "Identifier of the submitted entity")]
    pub entity_id: String,
    #[arg(long, help = "User id of the submitter")]
    pub submitted_by: String,
    #[arg(long, value_parser = crate::parse_decimal, help = "Expense amount")]
    pub amount: Option<Decimal>,
    #[arg(long, value_parser = crate::parse_decimal, help = "Leave duration in days")]
    pub days: Option<Decimal>,
    #[arg(long, help = "Entity category used by category-scoped chains")]
    pub category: Option<String>,
}

impl SubmitArgs {
    fn attributes(&self) -> EntityAttributes {
        EntityAttributes { amount: self.amount, days: self.days, category: self.category.clone() }
    }
}

pub fn run(options: &LoadOptions, args: SubmitArgs) -> CommandResult {
    let config = match load_config("submit", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("submit") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let context = audit_context(&args.submitted_by);
    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let submitted = approval_service(pool.clone(), &config)
            .submit(
                args.entity_type,
                &args.entity_id,
                &args.attributes(),
                &args.submitted_by,
                &context,
            )
            .await;
        pool.close().await;

        let progress =
            submitted.map_err(|error| application_failure(error, &context.correlation_id))?;
        let data = to_json(&progress)?;
        Ok((progress, data))
    });

    match result {
        Ok((progress, data)) => CommandResult::success_with_data(
            "submit",
            format!(
                "{} `{}` routed to chain `{}` as progress `{}`",
                progress.entity_type.as_str(),
                progress.entity_id,
                progress.chain_id.0,
                progress.id.0
            ),
            Some(data),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("submit", error_class, message, exit_code)
        }
    }
}
