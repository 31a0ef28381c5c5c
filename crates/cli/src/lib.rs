pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use wrkspace_core::config::{AppConfig, LoadOptions, LogFormat};
use wrkspace_core::domain::approval::{Decision, EntityType};

#[derive(Debug, Parser)]
#[command(
    name = "wrkspace",
    about = "wrkspace approval workflow operator CLI",
    long_about = "Manage approval chains, submit entities for approval and record decisions.",
    after_help = concat!(
        "Examples:\n",
        "  wrkspace migrate\n",
        "  wrkspace chains import chains.toml\n",
        "  wrkspace submit expense EXP-42 --submitted-by u-7 --amount 5000\n",
        "  wrkspace decide <progress-id> --step 1 --approver u-3 --role manager --decision approve"
    )
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a wrkspace.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the starter approval chains and verify them")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, DB connectivity, and approval chain coverage")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Manage approval chain definitions")]
    Chains {
        #[command(subcommand)]
        command: ChainsCommand,
    },
    #[command(about = "Select a chain for an entity and open its approval progress")]
    Submit(commands::submit::SubmitArgs),
    #[command(about = "Record an approve or reject decision on the current step")]
    Decide(commands::decide::DecideArgs),
    #[command(about = "List pending approvals the given approver can act on")]
    Pending(commands::pending::PendingArgs),
    #[command(about = "Show one approval progress record")]
    Show {
        #[arg(help = "Approval progress id")]
        progress_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum ChainsCommand {
    #[command(about = "Validate and upsert chains from a TOML definitions file")]
    Import {
        #[arg(help = "Path to the chain definitions file")]
        path: PathBuf,
    },
    #[command(about = "List every stored chain")]
    List,
    #[command(about = "Report entity types without an active unconditional chain")]
    Check,
    #[command(about = "Stop selecting a chain for new submissions")]
    Deactivate {
        #[arg(help = "Chain id")]
        chain_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config, ..LoadOptions::default() };

    if let Ok(config) = AppConfig::load(options.clone()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Seed => commands::seed::run(&options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(&options) }
        }
        Command::Doctor { json } => commands::doctor::run(&options, json),
        Command::Chains { command } => match command {
            ChainsCommand::Import { path } => commands::chains::import(&options, &path),
            ChainsCommand::List => commands::chains::list(&options),
            ChainsCommand::Check => commands::chains::check(&options),
            ChainsCommand::Deactivate { chain_id } => {
                commands::chains::deactivate(&options, &chain_id)
            }
        },
        Command::Submit(args) => commands::submit::run(&options, args),
        Command::Decide(args) => commands::decide::run(&options, args),
        Command::Pending(args) => commands::pending::run(&options, args),
        Command::Show { progress_id } => commands::show::run(&options, &progress_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so command payloads on stdout stay machine-readable.
fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    // A subscriber may already be installed when commands run in-process.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub(crate) fn parse_entity_type(value: &str) -> Result<EntityType, String> {
    EntityType::parse(value)
        .ok_or_else(|| format!("unknown entity type `{value}` (expected expense|leave|request)"))
}

pub(crate) fn parse_decision(value: &str) -> Result<Decision, String> {
    Decision::parse(value)
        .ok_or_else(|| format!("unknown decision `{value}` (expected approve|reject)"))
}

pub(crate) fn parse_decimal(value: &str) -> Result<Decimal, String> {
    value.trim().parse::<Decimal>().map_err(|error| format!("invalid number `{value}`: {error}"))
}
