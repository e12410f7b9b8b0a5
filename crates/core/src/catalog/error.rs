//! Errors raised while loading dataset definitions

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the dataset catalog
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The definition file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The definition file is not valid YAML for the expected shape
    #[error("Invalid dataset definition in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A dataset id appears more than once
    #[error("Duplicate dataset id: {0}")]
    DuplicateId(String),

    /// A dataset id was requested that is not defined
    #[error("Dataset not found: {0}")]
    NotFound(String),
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

impl CatalogError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            CatalogError::Io { path, .. } => format!(
                "{self}\n\nHint: Check that {} exists and is readable.",
                path.display()
            ),
            CatalogError::Parse { .. } => format!(
                "{self}\n\nHint: The file must contain a `datasets:` list or a `pipelines:` list of groups with `id` and `datasets`."
            ),
            CatalogError::DuplicateId(id) => format!(
                "{self}\n\nHint: Dataset ids name snapshot files and tables; rename one of the '{id}' entries."
            ),
            CatalogError::NotFound(_) => {
                format!("{self}\n\nHint: Run `getl pipelines` to list configured datasets.")
            }
        }
    }
}
