//! Cross-dataset SQL run after the merge

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{MergeError, MergeResult};
use crate::db::Database;
use crate::event::{EventSink, PipelineEvent, emit};
use crate::sink::{LogSink, log_line};
use crate::templates::{Sections, TemplateCatalog, has_statements};

const PHASE: &str = "post_merge";

/// Outcome of the post-merge phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMergeReport {
    pub success: bool,
    /// Files executed successfully
    pub executed: Vec<String>,
    /// `(file, error text)`
    pub failed: Vec<(String, String)>,
}

/// Execute every `*_merged.sql` in the template root against the warehouse
///
/// Files run in filename order; only their up section is executed. A failing
/// file marks the phase unsuccessful and the next file still runs.
pub fn run_merged_sql(
    warehouse: &Database,
    catalog: &TemplateCatalog,
    events: Option<&EventSink>,
    sink: Option<&LogSink>,
) -> MergeResult<PostMergeReport> {
    let files = catalog
        .merged_files()
        .map_err(|e| MergeError::PostMerge {
            file: catalog.root().display().to_string(),
            message: e.to_string(),
        })?;

    let mut report = PostMergeReport {
        success: true,
        ..Default::default()
    };
    if files.is_empty() {
        return Ok(report);
    }

    info!(files = files.len(), "Running post-merge SQL");
    log_line(sink, format!("Running {} post-merge SQL file(s)", files.len()));
    emit(
        events,
        PipelineEvent::started(PHASE, format!("Running {} post-merge files", files.len())),
    );

    let total = files.len();
    for (index, path) in files.iter().enumerate() {
        let name = file_name(path);
        log_line(sink, format!("  {name}"));
        match execute_file(warehouse, path) {
            Ok(()) => report.executed.push(name.clone()),
            Err(e) => {
                warn!(file = %name, error = %e, "Post-merge SQL failed");
                log_line(sink, format!("    ✗ {e}"));
                report.failed.push((name.clone(), e.to_string()));
            }
        }
        emit(
            events,
            PipelineEvent::progress(PHASE, name).with_step(index + 1, total),
        );
    }

    report.success = report.failed.is_empty();
    let done = if report.success {
        PipelineEvent::completed(PHASE, format!("{} post-merge files executed", total))
    } else {
        PipelineEvent::failed(PHASE, format!("{} post-merge files failed", report.failed.len()))
    };
    emit(events, done.with_progress(1.0));
    Ok(report)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn execute_file(warehouse: &Database, path: &Path) -> MergeResult<()> {
    let content = std::fs::read_to_string(path).map_err(|source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let up = Sections::parse(&content).up;
    if !has_statements(&up) {
        return Ok(());
    }
    warehouse
        .execute_batch(&up)
        .map_err(|e| MergeError::PostMerge {
            file: file_name(path),
            message: e.to_string(),
        })
}
