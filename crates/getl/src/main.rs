//! getl - geospatial ETL command line
//!
//! Runs extraction/transform pipelines and manages warehouse migrations.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::migrate::{MigrateArgs, handle_migrate};
use commands::pipelines::{PipelinesArgs, handle_pipelines};
use commands::run::{RunArgs, handle_run};
use error::CliError;
use getl_core::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "getl", version, about = "Geospatial ETL pipelines on DuckDB")]
struct Cli {
    /// Project root (default: $GETL_ROOT or the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage warehouse migrations
    Migrate(MigrateArgs),
    /// Run the ETL pipeline
    Run(RunArgs),
    /// List pipeline groups and dataset types
    Pipelines(PipelinesArgs),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn settings_for(root: Option<PathBuf>) -> Result<Settings, CliError> {
    let settings = match root {
        Some(root) => Settings::new(root),
        None => Settings::from_env(),
    };
    settings.validate().map_err(CliError::InvalidArgument)?;
    Ok(settings)
}

fn execute(cli: Cli) -> Result<(), CliError> {
    let settings = settings_for(cli.root)?;
    match cli.command {
        Commands::Migrate(args) => handle_migrate(&args, &settings),
        Commands::Pipelines(args) => handle_pipelines(&args, &settings),
        Commands::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(handle_run(&args, settings))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::FAILURE
        }
    }
}
