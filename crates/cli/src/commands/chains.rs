use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use wrkspace_core::config::LoadOptions;
use wrkspace_core::domain::approval::{ApprovalChain, ChainId};
use wrkspace_core::ChainFile;

use crate::commands::{
    application_failure, approval_service, build_runtime, correlation_id, load_config, open_pool,
    to_json, CommandResult,
};

pub fn import(options: &LoadOptions, path: &Path) -> CommandResult {
    let chains = match read_chain_file(path) {
        Ok(chains) => chains,
        Err(error) => {
            let message = format!("{error:#}");
            return CommandResult::failure("chains import", "chain_definitions", message, 7);
        }
    };

    let config = match load_config("chains import", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("chains import") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let saved = approval_service(pool.clone(), &config).save_chains(chains).await;
        pool.close().await;

        let saved = saved.map_err(|error| application_failure(error, &correlation_id()))?;
        Ok(saved.into_iter().map(|chain| chain.id.0).collect::<Vec<_>>())
    });

    match result {
        Ok(saved) => CommandResult::success_with_data(
            "chains import",
            format!("imported {} approval chain(s) from {}", saved.len(), path.display()),
            Some(json!({ "chain_ids": saved })),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chains import", error_class, message, exit_code)
        }
    }
}

fn read_chain_file(path: &Path) -> anyhow::Result<Vec<ApprovalChain>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read chain definitions `{}`", path.display()))?;
    let file = ChainFile::parse(&raw)
        .with_context(|| format!("invalid chain definitions in `{}`", path.display()))?;
    Ok(file.into_chains(Utc::now())?)
}

pub fn list(options: &LoadOptions) -> CommandResult {
    let config = match load_config("chains list", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("chains list") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let listed = approval_service(pool.clone(), &config).list_chains().await;
        pool.close().await;

        let chains = listed.map_err(|error| application_failure(error, &correlation_id()))?;
        let data = to_json(&chains)?;
        Ok((chains.len(), data))
    });

    match result {
        Ok((count, data)) => CommandResult::success_with_data(
            "chains list",
            format!("{count} approval chain(s) stored"),
            Some(data),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chains list", error_class, message, exit_code)
        }
    }
}

pub fn check(options: &LoadOptions) -> CommandResult {
    let config = match load_config("chains check", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("chains check") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let gaps = approval_service(pool.clone(), &config).coverage_gaps().await;
        pool.close().await;
        gaps.map_err(|error| application_failure(error, &correlation_id()))
    });

    match result {
        Ok(gaps) if gaps.is_empty() => CommandResult::success_with_data(
            "chains check",
            "every entity type has an active unconditional chain",
            Some(json!({ "gaps": [] })),
        ),
        Ok(gaps) => {
            let listed = gaps.iter().map(|gap| gap.as_str()).collect::<Vec<_>>();
            let message = format!("no active unconditional chain for: {}", listed.join(", "));
            if config.approvals.require_fallback_chain {
                CommandResult::failure("chains check", "coverage_gap", message, 6)
            } else {
                CommandResult::success_with_data(
                    "chains check",
                    message,
                    Some(json!({ "gaps": listed })),
                )
            }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chains check", error_class, message, exit_code)
        }
    }
}

pub fn deactivate(options: &LoadOptions, chain_id: &str) -> CommandResult {
    let config = match load_config("chains deactivate", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("chains deactivate") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let outcome = approval_service(pool.clone(), &config)
            .deactivate_chain(&ChainId(chain_id.to_string()))
            .await;
        pool.close().await;
        outcome.map_err(|error| application_failure(error, &correlation_id()))
    });

    match result {
        Ok(()) => CommandResult::success(
            "chains deactivate",
            format!("chain `{chain_id}` will no longer be selected for new submissions"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chains deactivate", error_class, message, exit_code)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::read_chain_file;

    #[test]
    fn read_chain_file_reports_path_and_cause() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chains.toml");
        fs::write(
            &path,
            r#"
[[chains]]
id = "bad"
name = "Bad"
entity_type = "invoice"

[[chains.steps]]
order = 1
role = "manager"
"#,
        )
        .expect("write");

        let message = format!("{:#}", read_chain_file(&path).expect_err("unknown type"));
        assert!(message.contains("unknown entity_type `invoice`"), "{message}");
    }

    #[test]
    fn read_chain_file_missing_path_names_file() {
        let message =
            format!("{:#}", read_chain_file("/nonexistent/chains.toml".as_ref()).expect_err("io"));
        assert!(message.contains("/nonexistent/chains.toml"), "{message}");
    }
}
