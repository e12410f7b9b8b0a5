//! Error types for extraction

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;

/// Errors raised while extracting a dataset
#[derive(Error, Debug)]
pub enum ExtractError {
    /// No extractor is registered under the dataset's plugin name
    #[error("Unknown extractor plugin '{name}' (available: {})", available.join(", "))]
    UnknownPlugin { name: String, available: Vec<String> },

    /// The dataset lacks a parameter the extractor needs
    #[error("Dataset '{dataset}' is missing required field '{field}'")]
    MissingField { dataset: String, field: String },

    /// The source reported an error
    #[error("Source error: {0}")]
    Source(String),

    /// The extraction call exceeded its timeout
    #[error("Extraction of '{dataset}' timed out after {seconds}s")]
    Timeout { dataset: String, seconds: u64 },

    /// The run was cancelled before this dataset started
    #[error("cancelled")]
    Cancelled,

    /// Download of a remote source failed
    #[error("Download of {url} failed: {message}")]
    Download { url: String, message: String },

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

    /// The extraction task panicked or was aborted
    #[error("Extraction task failed: {0}")]
    Task(String),
}

impl ExtractError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExtractError::Io {
            path: path.into(),
            source,
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            ExtractError::UnknownPlugin { .. } => format!(
                "{self}\n\nHint: Set `plugin:` in the dataset definition to one of the available extractors."
            ),
            ExtractError::MissingField { field, .. } => format!(
                "{self}\n\nHint: Add `{field}:` to the dataset entry in datasets.yml."
            ),
            ExtractError::Timeout { .. } => format!(
                "{self}\n\nHint: The source may be slow; raise the extraction timeout or retry later."
            ),
            ExtractError::Download { .. } => {
                format!("{self}\n\nHint: Check network access and that the URL is reachable.")
            }
            _ => self.to_string(),
        }
    }
}

impl From<duckdb::Error> for ExtractError {
    fn from(err: duckdb::Error) -> Self {
        ExtractError::Db(DbError::from(err))
    }
}
