//! Error types for template discovery and rendering

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the template catalog and generator
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Filesystem error with path context
    #[error("IO error with {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid discovery pattern
    #[error("Invalid template pattern: {0}")]
    Pattern(String),

    /// Template path does not name a file under the template root
    #[error("Invalid template path: {0}")]
    InvalidPath(String),
}

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

impl TemplateError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            TemplateError::Io { path, .. } => format!(
                "{self}\n\nHint: Check that the template directory {} exists and is readable.",
                path.display()
            ),
            TemplateError::InvalidPath(_) => format!(
                "{self}\n\nHint: Template paths are relative to the migrations directory, e.g. `aab_ext_restr/001_staging_x_template.sql`."
            ),
            TemplateError::Pattern(_) => self.to_string(),
        }
    }
}
