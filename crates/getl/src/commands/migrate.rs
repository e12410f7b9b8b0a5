//! `getl migrate` - warehouse schema migrations

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::error::CliError;
use getl_core::db::Database;
use getl_core::ledger::{MigrationResult, MigrationStatus, Migrator};
use getl_core::settings::Settings;
use getl_core::sink::stdout_sink;

/// Arguments for the `migrate` command
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Warehouse database (default: data/warehouse.duckdb)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Migration directory (default: sql/migrations)
    #[arg(long)]
    pub migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: MigrateCommand,
}

#[derive(Subcommand, Debug)]
pub enum MigrateCommand {
    /// Show applied and pending migrations
    Status,
    /// Apply pending migrations
    Migrate {
        /// Stop after this version
        #[arg(long)]
        target: Option<String>,
    },
    /// Roll back the most recent migrations
    Rollback {
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Create a new empty migration file
    Create {
        /// Migration name
        name: String,
    },
}

/// Handle the `migrate` command
pub fn handle_migrate(args: &MigrateArgs, settings: &Settings) -> Result<(), CliError> {
    let db_path = args.db.clone().unwrap_or_else(|| settings.warehouse_path.clone());
    let dir = args
        .migrations_dir
        .clone()
        .unwrap_or_else(|| settings.migrations_dir.clone());
    let sink = stdout_sink();

    if let MigrateCommand::Create { name } = &args.command {
        // creating a file never touches the warehouse
        let db = Database::memory()?;
        Migrator::new(&db, &dir)?.create(name, Some(&sink))?;
        return Ok(());
    }

    let db = Database::open(&db_path)?;
    let migrator = Migrator::new(&db, &dir)?;

    match &args.command {
        MigrateCommand::Status => print_status(&migrator),
        MigrateCommand::Migrate { target } => {
            println!("Migrating {}", db_path.display());
            let result = migrator.migrate(target.as_deref(), Some(&sink))?;
            finish(result)
        }
        MigrateCommand::Rollback { steps } => {
            if *steps == 0 {
                return Err(CliError::InvalidArgument(
                    "--steps must be at least 1".to_string(),
                ));
            }
            let result = migrator.rollback(*steps, Some(&sink))?;
            finish(result)
        }
        MigrateCommand::Create { .. } => Ok(()),
    }
}

fn print_status(migrator: &Migrator<'_>) -> Result<(), CliError> {
    let rows = migrator.status()?;
    println!("Migrations in {}", migrator.migrations_dir().display());
    if rows.is_empty() {
        println!("  (none)");
    }
    for row in &rows {
        let mark = match row.status {
            MigrationStatus::Applied => "✓",
            MigrationStatus::Pending => " ",
        };
        let down = if row.has_down { "" } else { "  (no down)" };
        println!("  [{mark}] {}_{}{down}", row.version, row.name);
    }

    let pending = rows
        .iter()
        .filter(|r| r.status == MigrationStatus::Pending)
        .count();
    println!();
    println!("Applied: {}, pending: {}", rows.len() - pending, pending);

    let templates = migrator.template_status()?;
    if !templates.is_empty() {
        println!();
        println!("Templates (datasets applied):");
        for row in templates {
            println!(
                "  {} {:<40} {}",
                row.version, row.name, row.datasets_applied
            );
        }
    }
    Ok(())
}

fn finish(result: MigrationResult) -> Result<(), CliError> {
    println!("{}", result.message);
    if result.success {
        Ok(())
    } else {
        Err(CliError::MigrationFailed(result.message))
    }
}
