//! Error types for the migration ledger

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;
use crate::templates::TemplateError;

/// Errors raised by the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database error
    #[error(transparent)]
    Db(#[from] DbError),

    /// Migration file could not be read or written
    #[error("IO error with {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Template discovery error
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Invalid migration name for `create`
    #[error("Invalid migration name: {0:?}")]
    InvalidName(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::Db(e) => e.user_message(),
            LedgerError::Template(e) => e.user_message(),
            LedgerError::Io { path, .. } => format!(
                "{self}\n\nHint: Check that the migrations directory {} exists and is writable.",
                path.display()
            ),
            LedgerError::InvalidName(_) => format!(
                "{self}\n\nHint: Use letters, digits and spaces, e.g. `getl migrate create \"add h3 index\"`."
            ),
        }
    }
}

impl From<duckdb::Error> for LedgerError {
    fn from(err: duckdb::Error) -> Self {
        LedgerError::Db(err.into())
    }
}
