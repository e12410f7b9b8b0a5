//! Error types for pipeline runs
//!
//! Per-dataset failures never surface here; they are counted in the
//! [`PipelineReport`](super::PipelineReport). A `PipelineError` means the
//! run could not start or a phase could not run at all.

use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::db::DbError;
use crate::extract::ExtractError;
use crate::ledger::LedgerError;
use crate::merge::MergeError;
use crate::templates::TemplateError;
use crate::transform::TransformError;

/// Errors that can occur during a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid settings or run options
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A phase could not run
    #[error("Stage '{stage}' failed: {message}")]
    StageError { stage: String, message: String },

    /// Dataset definitions could not be loaded
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Template discovery error
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Migration ledger error
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Extraction error
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// Transform error
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Merge error
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Database error
    #[error(transparent)]
    Db(#[from] DbError),

    /// IO error with path context
    #[error("IO error with {path}: {message}")]
    IoErrorWithPath {
        path: PathBuf,
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A background task panicked
    #[error("Task failed: {0}")]
    Task(String),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Create a stage error with message
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageError {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create an IO error with path context
    pub fn io_with_path(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::IoErrorWithPath {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::ConfigError(msg) => format!(
                "Configuration error: {msg}\n\nHint: Check GETL_* environment variables and command-line limits."
            ),
            PipelineError::IoErrorWithPath { path, .. } => format!(
                "{self}\n\nHint: Check that {} exists and is writable.",
                path.display()
            ),
            PipelineError::Catalog(e) => e.user_message(),
            PipelineError::Template(e) => e.user_message(),
            PipelineError::Ledger(e) => e.user_message(),
            PipelineError::Extract(e) => e.user_message(),
            PipelineError::Transform(e) => e.user_message(),
            PipelineError::Merge(e) => e.user_message(),
            PipelineError::Db(e) => e.user_message(),
            _ => self.to_string(),
        }
    }
}
