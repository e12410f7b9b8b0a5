//! Outcome of a pipeline run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::RunMode;

/// One dataset failure, tagged with the phase it failed in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFailure {
    pub dataset: String,
    pub phase: String,
    pub message: String,
}

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Run ID
    pub run_id: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Datasets with a snapshot after the extract phase
    pub datasets_extracted: usize,
    /// Datasets that failed in any phase
    pub datasets_failed: usize,
    /// Datasets whose template chain completed
    pub datasets_transformed: usize,
    /// Datasets never started because the run was cancelled
    pub datasets_skipped: usize,
    /// Templates executed across all datasets
    pub templates_applied: usize,
    /// Tables copied into the warehouse
    pub tables_merged: usize,
    /// Merge ran and every database merged
    pub merge_success: bool,
    /// Every `*_merged.sql` file succeeded
    pub post_merge_success: bool,
    /// Warehouse-level error that stopped the merge
    pub merge_error: Option<String>,
    pub failures: Vec<DatasetFailure>,
}

impl PipelineReport {
    pub(crate) fn start(run_id: impl Into<String>, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            mode,
            started_at: now,
            finished_at: now,
            datasets_extracted: 0,
            datasets_failed: 0,
            datasets_transformed: 0,
            datasets_skipped: 0,
            templates_applied: 0,
            tables_merged: 0,
            merge_success: true,
            post_merge_success: true,
            merge_error: None,
            failures: Vec::new(),
        }
    }

    pub(crate) fn record_failures<'a>(
        &mut self,
        phase: &str,
        failed: impl IntoIterator<Item = &'a (String, String)>,
    ) {
        for (dataset, message) in failed {
            self.failures.push(DatasetFailure {
                dataset: dataset.clone(),
                phase: phase.to_string(),
                message: message.clone(),
            });
        }
        let unique: std::collections::HashSet<&str> =
            self.failures.iter().map(|f| f.dataset.as_str()).collect();
        self.datasets_failed = unique.len();
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    /// No dataset failed and the merge succeeded
    ///
    /// Post-merge failures are reported but do not fail the run.
    pub fn is_success(&self) -> bool {
        self.datasets_failed == 0 && self.merge_success
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    /// Get formatted duration
    pub fn duration_formatted(&self) -> String {
        let secs = self.duration_ms() / 1000;
        let mins = secs / 60;
        let remaining_secs = secs % 60;

        if mins > 0 {
            format!("{}m {}s", mins, remaining_secs)
        } else {
            format!("{}s", secs)
        }
    }

    /// Summary lines, one per counter and one per failure
    pub fn summary_lines(&self) -> Vec<String> {
        let status = if self.is_success() { "completed" } else { "failed" };
        let mut lines = vec![
            format!("Pipeline {} - {} ({})", self.run_id, status, self.mode),
            format!("Duration: {}", self.duration_formatted()),
            format!("  Extracted:   {}", self.datasets_extracted),
            format!("  Transformed: {}", self.datasets_transformed),
            format!("  Failed:      {}", self.datasets_failed),
        ];
        if self.datasets_skipped > 0 {
            lines.push(format!("  Skipped:     {}", self.datasets_skipped));
        }
        if self.mode.transforms() {
            lines.push(format!(
                "  Merge:       {} ({} tables)",
                if self.merge_success { "ok" } else { "failed" },
                self.tables_merged
            ));
            if let Some(error) = &self.merge_error {
                lines.push(format!("  Merge error: {error}"));
            }
            if !self.post_merge_success {
                lines.push("  Post-merge:  failed".to_string());
            }
        }
        for failure in &self.failures {
            lines.push(format!(
                "  ✗ {} [{}]: {}",
                failure.dataset, failure.phase, failure.message
            ));
        }
        lines
    }

    /// Print summary to stderr
    pub fn print_summary(&self) {
        eprintln!();
        for line in self.summary_lines() {
            eprintln!("{line}");
        }
    }
}
