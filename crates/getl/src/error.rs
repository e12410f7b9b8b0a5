//! CLI error type

use thiserror::Error;

use getl_core::catalog::CatalogError;
use getl_core::db::DbError;
use getl_core::ledger::LedgerError;
use getl_core::pipeline::PipelineError;
use getl_core::templates::TemplateError;

/// Errors surfaced by `getl` commands
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Migrate or rollback stopped on a failing migration
    #[error("{0}")]
    MigrationFailed(String),

    /// The run completed with failed datasets or a failed merge
    #[error("Pipeline finished with {failed} failed dataset(s)")]
    PipelineFailed { failed: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Message printed before exiting
    pub fn user_message(&self) -> String {
        match self {
            CliError::Catalog(e) => e.user_message(),
            CliError::Template(e) => e.user_message(),
            CliError::Ledger(e) => e.user_message(),
            CliError::Db(e) => e.user_message(),
            CliError::Pipeline(e) => e.user_message(),
            CliError::PipelineFailed { .. } => {
                format!("{self}\n\nHint: See the log file in the logs directory for details.")
            }
            _ => self.to_string(),
        }
    }
}
