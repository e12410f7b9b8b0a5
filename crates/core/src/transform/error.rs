//! Error types for the transform executor

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;
use crate::ledger::LedgerError;
use crate::templates::TemplateError;

/// Errors that abort one dataset's transform
#[derive(Error, Debug)]
pub enum TransformError {
    /// The extraction snapshot is missing
    #[error("Snapshot for '{dataset}' not found at {path}")]
    MissingSnapshot { dataset: String, path: PathBuf },

    /// Baseline migrations failed in the ephemeral database
    #[error("Initializing database for '{dataset}' failed: {message}")]
    Init { dataset: String, message: String },

    /// A rendered template failed to execute
    #[error("Template {template} failed for '{dataset}': {message}")]
    Template {
        dataset: String,
        template: String,
        message: String,
    },

    /// Template discovery or rendering error
    #[error(transparent)]
    Render(#[from] TemplateError),

    /// Ledger error
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Database error
    #[error(transparent)]
    Db(#[from] DbError),

    /// IO error
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transform task panicked
    #[error("Transform task failed: {0}")]
    Task(String),
}

/// Result type for transform operations
pub type TransformResult<T> = Result<T, TransformError>;

impl TransformError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            TransformError::MissingSnapshot { .. } => format!(
                "{self}\n\nHint: Run the extraction first, or drop --transform-only."
            ),
            TransformError::Template { template, .. } => format!(
                "{self}\n\nHint: The ephemeral database is kept in the temp directory; open it to inspect the schemas {template} reads from."
            ),
            TransformError::Render(e) => e.user_message(),
            TransformError::Ledger(e) => e.user_message(),
            TransformError::Db(e) => e.user_message(),
            _ => self.to_string(),
        }
    }
}

impl From<duckdb::Error> for TransformError {
    fn from(err: duckdb::Error) -> Self {
        TransformError::Db(DbError::from(err))
    }
}
