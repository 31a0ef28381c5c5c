use wrkspace_core::config::LoadOptions;
use wrkspace_db::{ChainSeedInfo, DefaultChainSeed};

use crate::commands::{build_runtime, load_config, open_pool, CommandError, CommandResult};

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config("seed", options) {
        Ok(config) => config,
        Err(result) => return result,
    };

    let runtime = match build_runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;

        let seed_result = DefaultChainSeed::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DefaultChainSeed::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<Vec<ChainSeedInfo>, CommandError> = if !verification.all_present {
            let failed_checks = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
                .collect::<Vec<_>>();
            Err(("seed_verification", verification_failure_message(&failed_checks), 6u8))
        } else {
            Ok(seed_result.chains_seeded)
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(chains) => {
            let chain_descriptions: Vec<String> = chains
                .iter()
                .map(|chain| {
                    format!(
                        "  - {}: {} ({} steps)",
                        chain.entity_type.as_str(),
                        chain.chain_id,
                        chain.steps
                    )
                })
                .collect();
            let message = format!(
                "starter approval chains loaded:\n{}",
                chain_descriptions.join("\n")
            );
            CommandResult::success("seed", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn verification_failure_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "some starter chains failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed_checks.join(", "))
    }
}
