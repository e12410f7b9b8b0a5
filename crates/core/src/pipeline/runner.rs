//! Pipeline runner
//!
//! Sequences extract → transform → merge → post-merge for one selection of
//! datasets. Per-dataset failures are collected into the
//! [`PipelineReport`]; only problems that prevent a phase from starting are
//! returned as errors.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::config::{RunMode, RunOptions};
use super::error::{PipelineError, PipelineResult};
use super::report::PipelineReport;
use crate::catalog::DatasetConfig;
use crate::db::Database;
use crate::event::{EventSink, PipelineEvent, emit};
use crate::extract::{ExtractContext, ExtractScheduler, ExtractorRegistry};
use crate::ledger::Migrator;
use crate::merge::{
    MergeCoordinator, MergeReport, PostMergeReport, cleanup_temp_dbs, prepare_warehouse,
    run_merged_sql,
};
use crate::settings::Settings;
use crate::sink::{LogSink, log_line};
use crate::templates::{TemplateCatalog, TemplateGenerator};
use crate::transform::TransformExecutor;

const PHASE: &str = "pipeline";

/// Runs the full ETL pipeline against one project layout
pub struct PipelineRunner {
    settings: Arc<Settings>,
    registry: ExtractorRegistry,
    generator: Arc<TemplateGenerator>,
    events: Option<EventSink>,
}

impl PipelineRunner {
    /// Create a runner, validating the settings
    pub fn new(settings: Settings, registry: ExtractorRegistry) -> PipelineResult<Self> {
        settings.validate().map_err(PipelineError::ConfigError)?;
        let generator = TemplateGenerator::new(TemplateCatalog::new(&settings.migrations_dir))
            .with_fallback_boundary(settings.shared_staging_boundary.clone());
        Ok(Self {
            settings: Arc::new(settings),
            registry,
            generator: Arc::new(generator),
            events: None,
        })
    }

    /// Receive a [`PipelineEvent`] for every state change
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn generator(&self) -> &TemplateGenerator {
        &self.generator
    }

    /// Run the pipeline for `datasets`
    pub async fn run(
        &self,
        datasets: &[DatasetConfig],
        options: &RunOptions,
        sink: Option<LogSink>,
    ) -> PipelineResult<PipelineReport> {
        options.validate().map_err(PipelineError::ConfigError)?;
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline_run", run_id = %run_id, mode = %options.mode);
        self.run_inner(run_id, datasets, options, sink)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        datasets: &[DatasetConfig],
        options: &RunOptions,
        sink: Option<LogSink>,
    ) -> PipelineResult<PipelineReport> {
        let settings = &self.settings;
        let mut report = PipelineReport::start(run_id, options.mode);

        info!(
            datasets = datasets.len(),
            mode = %options.mode,
            force = options.force,
            "Starting pipeline"
        );
        log_line(
            sink.as_ref(),
            format!(
                "Pipeline {} ({}): {} dataset(s)",
                report.run_id,
                options.mode,
                datasets.len()
            ),
        );
        emit(
            self.events.as_ref(),
            PipelineEvent::started(PHASE, format!("Running {} datasets", datasets.len())),
        );

        settings
            .ensure_dirs()
            .map_err(|e| PipelineError::io_with_path(&settings.data_dir, "creating data directories", e))?;

        if options.force {
            let (removed, skipped) = cleanup_temp_dbs(&settings.temp_dir);
            if removed + skipped > 0 {
                log_line(
                    sink.as_ref(),
                    format!("Removed {removed} stale temp file(s), {skipped} locked"),
                );
            }
        }

        let extracted = if options.mode.extracts() {
            self.extract(datasets, options, sink.clone(), &mut report)
                .instrument(info_span!("pipeline_stage", stage = "extract"))
                .await
        } else {
            self.existing_snapshots(datasets, sink.as_ref(), &mut report)
        };

        if options.mode == RunMode::ExtractOnly {
            return Ok(self.finish(report, sink.as_ref()));
        }

        if extracted.is_empty() {
            log_line(sink.as_ref(), "No snapshots to transform");
            return Ok(self.finish(report, sink.as_ref()));
        }

        let executor = TransformExecutor::new(settings.clone(), self.generator.clone())
            .with_force(options.force)
            .with_cancellation(options.cancel.clone())
            .with_events(self.events.clone())
            .with_sink(sink.clone());
        let transformed = executor
            .run_parallel_transform(
                &extracted,
                datasets,
                options.phases,
                options.max_transforms.unwrap_or(settings.max_concurrent_sql),
            )
            .instrument(info_span!("pipeline_stage", stage = "transform"))
            .await;

        report.datasets_transformed = transformed.succeeded.len();
        report.datasets_skipped += transformed.skipped.len();
        report.templates_applied = transformed.templates_applied;
        report.record_failures("transform", &transformed.failed);

        if transformed.succeeded.is_empty() {
            log_line(sink.as_ref(), "No databases to merge");
            return Ok(self.finish(report, sink.as_ref()));
        }

        let merged = self
            .merge(transformed.succeeded, sink.clone())
            .instrument(info_span!("pipeline_stage", stage = "merge"))
            .await;
        match merged {
            Ok((merged, post)) => {
                report.merge_success = merged.success;
                report.tables_merged = merged.tables;
                report.post_merge_success = post.success;
                report.record_failures("merge", &merged.failed);
            }
            Err(e) => {
                error!(error = %e, "Merge phase failed");
                log_line(sink.as_ref(), format!("✗ Merge failed: {e}"));
                emit(
                    self.events.as_ref(),
                    PipelineEvent::failed("merge", e.to_string()),
                );
                report.merge_success = false;
                report.post_merge_success = false;
                report.merge_error = Some(e.to_string());
            }
        }

        Ok(self.finish(report, sink.as_ref()))
    }

    async fn extract(
        &self,
        datasets: &[DatasetConfig],
        options: &RunOptions,
        sink: Option<LogSink>,
        report: &mut PipelineReport,
    ) -> Vec<(String, PathBuf)> {
        let ctx = ExtractContext::from_settings(&self.settings).with_sink(sink);
        let scheduler = ExtractScheduler::new(self.registry.clone(), ctx, &self.settings.raw_dir)
            .with_cancellation(options.cancel.clone())
            .with_events(self.events.clone());
        let result = scheduler
            .run_parallel_extract(
                datasets,
                options
                    .max_extracts
                    .unwrap_or(self.settings.max_concurrent_extracts),
            )
            .await;

        report.datasets_extracted = result.succeeded.len();
        report.datasets_skipped += result.skipped.len();
        report.record_failures("extract", &result.failed);
        result.succeeded
    }

    /// Snapshots already on disk, for transform-only runs
    fn existing_snapshots(
        &self,
        datasets: &[DatasetConfig],
        sink: Option<&LogSink>,
        report: &mut PipelineReport,
    ) -> Vec<(String, PathBuf)> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for dataset in datasets {
            let path = self.settings.snapshot_path(&dataset.id);
            if path.is_file() {
                found.push((dataset.id.clone(), path));
            } else {
                warn!(dataset = %dataset.id, path = %path.display(), "No snapshot");
                missing.push((
                    dataset.id.clone(),
                    format!("no snapshot at {}", path.display()),
                ));
            }
        }
        log_line(
            sink,
            format!(
                "Found {} snapshot(s) in {}",
                found.len(),
                self.settings.raw_dir.display()
            ),
        );
        report.datasets_extracted = found.len();
        report.record_failures("extract", &missing);
        found
    }

    /// Merge ephemeral databases and run post-merge SQL on a blocking thread
    async fn merge(
        &self,
        pairs: Vec<(String, PathBuf)>,
        sink: Option<LogSink>,
    ) -> PipelineResult<(MergeReport, PostMergeReport)> {
        let settings = self.settings.clone();
        let generator = self.generator.clone();
        let events = self.events.clone();

        tokio::task::spawn_blocking(move || {
            let warehouse = Database::open(&settings.warehouse_path)?;
            warehouse.load_extensions(&settings.extensions);

            prepare_warehouse(&warehouse, &settings.migrations_dir)?;
            let init = Migrator::new(&warehouse, &settings.migrations_dir)?.run_init_migrations()?;
            if !init.success {
                return Err(PipelineError::stage("merge", init.message));
            }

            let merged = MergeCoordinator::new(&warehouse)
                .with_events(events.clone())
                .with_sink(sink.clone())
                .merge_databases(&pairs);
            let post = run_merged_sql(
                &warehouse,
                generator.catalog(),
                events.as_ref(),
                sink.as_ref(),
            )?;
            Ok((merged, post))
        })
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
    }

    fn finish(&self, report: PipelineReport, sink: Option<&LogSink>) -> PipelineReport {
        let report = report.finish();
        info!(
            extracted = report.datasets_extracted,
            transformed = report.datasets_transformed,
            failed = report.datasets_failed,
            merge_success = report.merge_success,
            duration_ms = report.duration_ms(),
            "Pipeline finished"
        );
        for line in report.summary_lines() {
            log_line(sink, line);
        }
        let message = format!(
            "{} extracted, {} transformed, {} failed",
            report.datasets_extracted, report.datasets_transformed, report.datasets_failed
        );
        let event = if report.is_success() {
            PipelineEvent::completed(PHASE, message)
        } else {
            PipelineEvent::failed(PHASE, message)
        };
        emit(self.events.as_ref(), event.with_progress(1.0));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, collecting_events};
    use crate::sink::collecting_sink;
    use tempfile::TempDir;

    fn project() -> (TempDir, Settings) {
        let dir = TempDir::new().unwrap();
        let settings = Settings::new(dir.path()).with_extensions(Vec::new());
        std::fs::create_dir_all(&settings.migrations_dir).unwrap();
        std::fs::write(
            settings.migrations_dir.join("001_init.sql"),
            "-- migrate:up\nCREATE SCHEMA IF NOT EXISTS staging;\n",
        )
        .unwrap();
        std::fs::write(
            settings.migrations_dir.join("010_mart_out_template.sql"),
            "-- migrate:up\nCREATE OR REPLACE TABLE mart.{{ dataset_id }} AS SELECT * FROM raw.{{ dataset_id }};\n",
        )
        .unwrap();
        (dir, settings)
    }

    fn write_snapshot(settings: &Settings, id: &str) {
        std::fs::create_dir_all(&settings.raw_dir).unwrap();
        let db = Database::memory().unwrap();
        let path = settings.snapshot_path(id);
        db.execute_batch(&format!(
            "COPY (SELECT 1 AS id, 'a' AS name) TO '{}' (FORMAT PARQUET);",
            path.display()
        ))
        .unwrap();
    }

    #[test]
    fn test_runner_rejects_invalid_settings() {
        let settings = Settings::new(".").with_max_concurrent_extracts(0);
        let result = PipelineRunner::new(settings, ExtractorRegistry::new());
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_transform_only_merges_existing_snapshots() {
        let (_dir, settings) = project();
        write_snapshot(&settings, "roads");
        let warehouse = settings.warehouse_path.clone();

        let (events, captured) = collecting_events();
        let runner = PipelineRunner::new(settings, ExtractorRegistry::new())
            .unwrap()
            .with_events(events);
        let datasets = vec![
            DatasetConfig::new("roads", "parquet"),
            DatasetConfig::new("lakes", "parquet"),
        ];
        let options = RunOptions::new().with_mode(RunMode::TransformOnly);
        let (sink, lines) = collecting_sink();

        let report = runner.run(&datasets, &options, Some(sink)).await.unwrap();

        assert_eq!(report.datasets_extracted, 1);
        assert_eq!(report.datasets_transformed, 1);
        assert_eq!(report.datasets_failed, 1);
        assert_eq!(report.failures[0].dataset, "lakes");
        assert!(report.merge_success);
        assert!(!report.is_success());

        let db = Database::open(&warehouse).unwrap();
        assert_eq!(db.row_count("mart", "roads").unwrap(), 1);

        let events = captured.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.phase, PHASE);
        assert_eq!(last.kind, EventKind::Failed);
        assert!(lines.lock().unwrap().iter().any(|l| l.contains("Transformed: 1")));
    }

    #[tokio::test]
    async fn test_nothing_to_transform_skips_merge() {
        let (_dir, settings) = project();
        let warehouse = settings.warehouse_path.clone();
        let runner = PipelineRunner::new(settings, ExtractorRegistry::new()).unwrap();
        let options = RunOptions::new().with_mode(RunMode::TransformOnly);

        let report = runner.run(&[], &options, None).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.tables_merged, 0);
        assert!(!warehouse.exists());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let (_dir, settings) = project();
        let runner = PipelineRunner::new(settings, ExtractorRegistry::new()).unwrap();
        let options = RunOptions::new().with_max_transforms(0);
        let result = runner.run(&[], &options, None).await;
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
