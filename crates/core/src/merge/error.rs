//! Error types for merging into the warehouse

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;
use crate::ledger::LedgerError;

/// Errors raised while merging one ephemeral database
#[derive(Error, Debug)]
pub enum MergeError {
    /// The ephemeral database is missing
    #[error("Ephemeral database for '{dataset}' not found at {path}")]
    MissingDatabase { dataset: String, path: PathBuf },

    /// ATTACH failed (locked or corrupt file)
    #[error("Cannot attach {path}: {message}")]
    Attach { path: PathBuf, message: String },

    /// Copying a table failed
    #[error("Copying {schema}.{table} for '{dataset}' failed: {message}")]
    Copy {
        dataset: String,
        schema: String,
        table: String,
        message: String,
    },

    /// A post-merge SQL file failed
    #[error("Post-merge SQL {file} failed: {message}")]
    PostMerge { file: String, message: String },

    /// Database error
    #[error(transparent)]
    Db(#[from] DbError),

    /// Ledger error
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// IO error
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for merge operations
pub type MergeResult<T> = Result<T, MergeError>;

impl MergeError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            MergeError::Attach { .. } => format!(
                "{self}\n\nHint: Another process may hold the file open; close it and rerun the merge."
            ),
            MergeError::PostMerge { file, .. } => format!(
                "{self}\n\nHint: {file} runs against the merged warehouse; check the tables it reads exist for every dataset."
            ),
            MergeError::Db(e) => e.user_message(),
            MergeError::Ledger(e) => e.user_message(),
            _ => self.to_string(),
        }
    }
}

impl From<duckdb::Error> for MergeError {
    fn from(err: duckdb::Error) -> Self {
        MergeError::Db(DbError::from(err))
    }
}
