//! Error types for database access

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the embedded database layer
#[derive(Error, Debug)]
pub enum DbError {
    /// Error reported by DuckDB
    #[error("Database error: {0}")]
    Database(String),

    /// Database file could not be opened
    #[error("Cannot open database {path}: {message}")]
    Open { path: PathBuf, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            DbError::Open { path, .. } => format!(
                "{self}\n\nHint: Another process may hold a lock on {}; close it and retry.",
                path.display()
            ),
            _ => self.to_string(),
        }
    }
}

impl From<duckdb::Error> for DbError {
    fn from(err: duckdb::Error) -> Self {
        DbError::Database(err.to_string())
    }
}
