//! Parallel per-dataset transforms
//!
//! Every dataset gets its own DuckDB file under the temp directory, so
//! transforms run in parallel without sharing a database lock. Inside one
//! dataset the template chain is applied strictly in order.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::{TransformError, TransformResult};
use super::geometry::normalize_geometry_column;
use super::phases::Phases;
use crate::cancel::CancellationFlag;
use crate::catalog::DatasetConfig;
use crate::db::{Database, quote_literal};
use crate::event::{EventSink, PipelineEvent, emit};
use crate::extract::load_raw_table;
use crate::ledger::Migrator;
use crate::settings::{CANONICAL_GEOMETRY, Settings};
use crate::sink::{LogSink, log_line};
use crate::templates::{MART_SCHEMA, RAW_SCHEMA, SchemaChain, TemplateGenerator, TemplateInfo, schema_name};

const PHASE: &str = "transform";

/// Schemas created in every ephemeral database before templates run
pub const BASE_SCHEMAS: [&str; 2] = [RAW_SCHEMA, MART_SCHEMA];

/// Aggregate outcome of a transform phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelTransformResult {
    /// `(dataset id, ephemeral database path)` of fully transformed datasets, in input order
    pub succeeded: Vec<(String, PathBuf)>,
    /// `(dataset id, error text)` in input order
    pub failed: Vec<(String, String)>,
    /// Datasets never started because the run was cancelled
    pub skipped: Vec<String>,
    /// Templates executed across all datasets
    pub templates_applied: usize,
    /// Templates skipped because the ledger already had them
    pub templates_skipped: usize,
}

impl ParallelTransformResult {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of one dataset's transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetTransform {
    pub dataset: String,
    pub db_path: PathBuf,
    pub rows: u64,
    pub applied: usize,
    pub skipped: usize,
}

/// Runs template chains for many datasets in isolated databases
pub struct TransformExecutor {
    settings: Arc<Settings>,
    generator: Arc<TemplateGenerator>,
    force: bool,
    cancel: CancellationFlag,
    events: Option<EventSink>,
    sink: Option<LogSink>,
}

struct TransformJob {
    dataset: DatasetConfig,
    snapshot: PathBuf,
    db_path: PathBuf,
    templates: Vec<TemplateInfo>,
    chain: SchemaChain,
    generator: Arc<TemplateGenerator>,
    settings: Arc<Settings>,
    force: bool,
    events: Option<EventSink>,
}

impl TransformExecutor {
    pub fn new(settings: Arc<Settings>, generator: Arc<TemplateGenerator>) -> Self {
        Self {
            settings,
            generator,
            force: false,
            cancel: CancellationFlag::new(),
            events: None,
            sink: None,
        }
    }

    /// Re-apply templates already recorded in the ledger
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Option<EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_sink(mut self, sink: Option<LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Templates run for one pipeline under `phases`, with their schema chain
    ///
    /// The chain is computed from the unfiltered list so that skipping a
    /// phase never changes which schema a later template reads from.
    pub fn plan(
        &self,
        pipeline: Option<&str>,
        phases: Phases,
    ) -> TransformResult<(Vec<TemplateInfo>, SchemaChain)> {
        let all = self.generator.catalog().list_templates(pipeline)?;
        let chain = SchemaChain::from_templates(&all, &self.settings.shared_staging_boundary);
        let selected = all.into_iter().filter(|t| phases.allows(t.kind())).collect();
        Ok((selected, chain))
    }

    /// Transform every extracted dataset, at most `max_concurrency` at a time
    ///
    /// `extracted` pairs dataset ids with snapshot paths; `datasets` supplies
    /// their configuration. Ids without a configuration use default field
    /// mappings and no pipeline.
    pub async fn run_parallel_transform(
        &self,
        extracted: &[(String, PathBuf)],
        datasets: &[DatasetConfig],
        phases: Phases,
        max_concurrency: usize,
    ) -> ParallelTransformResult {
        let limit = max_concurrency.max(1);
        let total = extracted.len();
        let configs: HashMap<&str, &DatasetConfig> =
            datasets.iter().map(|d| (d.id.as_str(), d)).collect();
        let mut plans: HashMap<Option<String>, (Vec<TemplateInfo>, SchemaChain)> = HashMap::new();

        let semaphore = Arc::new(Semaphore::new(limit));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut join_set = JoinSet::new();
        let mut outstanding: HashSet<String> = HashSet::new();
        let mut result = ParallelTransformResult::default();

        let phase_names: Vec<&str> = phases.enabled().iter().map(|p| p.name()).collect();
        info!(datasets = total, max_concurrency = limit, phases = ?phase_names, "Starting transform");
        log_line(
            self.sink.as_ref(),
            format!(
                "Transforming {total} dataset(s), up to {limit} at a time (phases: {})",
                phase_names.join(", ")
            ),
        );
        emit(
            self.events.as_ref(),
            PipelineEvent::started(PHASE, format!("Transforming {total} datasets")).with_progress(0.0),
        );

        for (index, (id, snapshot)) in extracted.iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Transform semaphore closed");
                    break;
                }
            };

            if self.cancel.is_cancelled() {
                for (skipped, _) in &extracted[index..] {
                    log_line(self.sink.as_ref(), format!("  - {skipped}: cancelled"));
                    emit(
                        self.events.as_ref(),
                        PipelineEvent::failed(PHASE, "cancelled").for_dataset(skipped),
                    );
                    result.skipped.push(skipped.clone());
                    result.failed.push((skipped.clone(), "cancelled".to_string()));
                }
                warn!(skipped = total - index, "Transform cancelled");
                break;
            }

            let dataset = configs
                .get(id.as_str())
                .map(|d| (*d).clone())
                .unwrap_or_else(|| DatasetConfig::new(id.clone(), "unknown"));
            let key = dataset.pipeline().map(str::to_string);
            if !plans.contains_key(&key) {
                match self.plan(key.as_deref(), phases) {
                    Ok(plan) => {
                        plans.insert(key.clone(), plan);
                    }
                    Err(e) => {
                        drop(permit);
                        finished.fetch_add(1, Ordering::SeqCst);
                        self.record_failure(&mut result, id, &e.to_string());
                        continue;
                    }
                }
            }
            let Some((templates, chain)) = plans.get(&key).cloned() else {
                continue;
            };

            let job = TransformJob {
                db_path: self.settings.temp_db_path(id),
                snapshot: snapshot.clone(),
                dataset,
                templates,
                chain,
                generator: self.generator.clone(),
                settings: self.settings.clone(),
                force: self.force,
                events: self.events.clone(),
            };
            let events = self.events.clone();
            let finished = finished.clone();
            let id = id.clone();
            outstanding.insert(id.clone());

            join_set.spawn(async move {
                let _permit = permit;
                emit(
                    events.as_ref(),
                    PipelineEvent::started(PHASE, format!("Transforming {id}")).for_dataset(&id),
                );

                let outcome = tokio::task::spawn_blocking(move || transform_dataset(&job))
                    .await
                    .map_err(|e| TransformError::Task(e.to_string()))
                    .and_then(|r| r)
                    .map_err(|e| e.to_string());

                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                let fraction = done as f64 / total.max(1) as f64;
                let event = match &outcome {
                    Ok(t) => PipelineEvent::completed(
                        PHASE,
                        format!("{id}: {} template(s) applied", t.applied),
                    )
                    .with_rows(t.rows),
                    Err(message) => PipelineEvent::failed(PHASE, message.clone()),
                };
                emit(events.as_ref(), event.for_dataset(&id).with_progress(fraction));

                (id, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, Ok(done))) => {
                    outstanding.remove(&id);
                    info!(
                        dataset = %id,
                        applied = done.applied,
                        skipped = done.skipped,
                        "Transform complete"
                    );
                    log_line(
                        self.sink.as_ref(),
                        format!(
                            "  ✓ {id}: {} applied, {} already applied",
                            done.applied, done.skipped
                        ),
                    );
                    result.templates_applied += done.applied;
                    result.templates_skipped += done.skipped;
                    result.succeeded.push((id, done.db_path));
                }
                Ok((id, Err(message))) => {
                    outstanding.remove(&id);
                    warn!(dataset = %id, error = %message, "Transform failed");
                    log_line(self.sink.as_ref(), format!("  ✗ {id}: {message}"));
                    result.failed.push((id, message));
                }
                Err(e) => error!(error = %e, "Transform task aborted"),
            }
        }
        for id in outstanding {
            result.failed.push((id, "transform task aborted".to_string()));
        }

        let position: HashMap<&str, usize> = extracted
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.as_str(), i))
            .collect();
        let key = |id: &String| position.get(id.as_str()).copied().unwrap_or(usize::MAX);
        result.succeeded.sort_by_key(|(id, _)| key(id));
        result.failed.sort_by_key(|(id, _)| key(id));

        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            templates = result.templates_applied,
            "Transform finished"
        );
        log_line(
            self.sink.as_ref(),
            format!(
                "Transformed {}/{} dataset(s), {} failed",
                result.succeeded.len(),
                total,
                result.failed.len()
            ),
        );
        emit(
            self.events.as_ref(),
            PipelineEvent::completed(
                PHASE,
                format!("Transformed {} of {} datasets", result.succeeded.len(), total),
            )
            .with_progress(1.0),
        );

        result
    }

    fn record_failure(&self, result: &mut ParallelTransformResult, id: &str, message: &str) {
        warn!(dataset = %id, error = %message, "Transform failed");
        log_line(self.sink.as_ref(), format!("  ✗ {id}: {message}"));
        emit(
            self.events.as_ref(),
            PipelineEvent::failed(PHASE, message).for_dataset(id),
        );
        result.failed.push((id.to_string(), message.to_string()));
    }
}

/// Remove an ephemeral database and its WAL
pub fn remove_db_files(path: &Path) -> std::io::Result<()> {
    let wal = PathBuf::from(format!("{}.wal", path.display()));
    for file in [path, wal.as_path()] {
        match std::fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Whether an existing ephemeral database predates the snapshot it was built from
fn is_stale(db_path: &Path, snapshot: &Path) -> bool {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(db_path), modified(snapshot)) {
        (Some(db), Some(snap)) => snap > db,
        _ => true,
    }
}

fn transform_dataset(job: &TransformJob) -> TransformResult<DatasetTransform> {
    let id = job.dataset.id.as_str();
    if !job.snapshot.is_file() {
        return Err(TransformError::MissingSnapshot {
            dataset: id.to_string(),
            path: job.snapshot.clone(),
        });
    }

    // A database left by an earlier failed run is resumed, unless forced or
    // the snapshot has since been replaced.
    if job.db_path.exists() && (job.force || is_stale(&job.db_path, &job.snapshot)) {
        remove_db_files(&job.db_path).map_err(|source| TransformError::Io {
            path: job.db_path.clone(),
            source,
        })?;
    }

    let db = Database::open(&job.db_path)?;
    db.load_extensions(&job.settings.extensions);
    db.create_schemas(&BASE_SCHEMAS)?;

    let migrator = Migrator::new(&db, &job.settings.migrations_dir)?;
    let init = migrator.run_init_migrations()?;
    if !init.success {
        let message = init
            .failed
            .first()
            .map(|(version, e)| format!("{version}: {e}"))
            .unwrap_or(init.message);
        return Err(TransformError::Init {
            dataset: id.to_string(),
            message,
        });
    }

    let rows = load_raw_table(
        &db,
        id,
        &format!(
            "SELECT * FROM read_parquet({})",
            quote_literal(&job.snapshot.to_string_lossy())
        ),
    )?;
    normalize_geometry_column(
        &db,
        RAW_SCHEMA,
        id,
        CANONICAL_GEOMETRY,
        &job.settings.geometry_aliases,
    )?;
    debug!(dataset = id, rows, "Snapshot loaded");

    let total = job.templates.len();
    let mut applied = 0;
    let mut skipped = 0;
    for (index, template) in job.templates.iter().enumerate() {
        let version = template.version();
        let step = |message: String| {
            emit(
                job.events.as_ref(),
                PipelineEvent::progress(PHASE, message)
                    .for_dataset(id)
                    .with_step(index + 1, total),
            );
        };

        if !job.force && migrator.is_template_applied(&version, id)? {
            skipped += 1;
            step(format!("{} already applied", template.filename));
            continue;
        }

        let sql = job
            .generator
            .render(template, id, &job.dataset.field_mapping, &job.chain)?;
        if !crate::templates::has_statements(&sql) {
            continue;
        }

        let schema = schema_name(&template.filename, template.pipeline.as_deref());
        db.create_schemas(&[schema.as_str()])?;
        debug!(dataset = id, template = %template.relative_path, bytes = sql.len(), "Applying template");
        db.execute_batch(&sql).map_err(|e| TransformError::Template {
            dataset: id.to_string(),
            template: template.relative_path.clone(),
            message: e.to_string(),
        })?;

        if job.force {
            migrator.forget_template(&version, id)?;
        }
        migrator.record_template(&version, &template.migration_name(), id, &sql)?;
        applied += 1;
        step(format!("{} applied", template.filename));
    }

    Ok(DatasetTransform {
        dataset: id.to_string(),
        db_path: job.db_path.clone(),
        rows,
        applied,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateCatalog;
    use crate::transform::Phase;
    use tempfile::TempDir;

    fn project() -> (TempDir, Arc<Settings>) {
        let dir = TempDir::new().unwrap();
        let settings = Settings::new(dir.path()).with_extensions(Vec::new());
        settings.ensure_dirs().unwrap();
        let migrations = &settings.migrations_dir;
        std::fs::create_dir_all(migrations).unwrap();
        std::fs::write(
            migrations.join("001_init.sql"),
            "-- migrate:up\nCREATE SCHEMA IF NOT EXISTS staging;\n-- migrate:down\nDROP SCHEMA staging;",
        )
        .unwrap();
        std::fs::write(
            migrations.join("004_staging_base_template.sql"),
            "CREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT * FROM {{ prev_schema }}.{{ dataset_id }};",
        )
        .unwrap();
        std::fs::write(
            migrations.join("010_mart_out_template.sql"),
            "CREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT id, geom FROM {{ prev_schema }}.{{ dataset_id }};",
        )
        .unwrap();
        (dir, Arc::new(settings))
    }

    fn snapshot(settings: &Settings, id: &str) -> PathBuf {
        let path = settings.snapshot_path(id);
        Database::memory()
            .unwrap()
            .execute_batch(&format!(
                "COPY (SELECT range AS id, 'POINT (0 0)' AS geometry FROM range(3)) TO '{}' (FORMAT PARQUET);",
                path.display()
            ))
            .unwrap();
        path
    }

    fn executor(settings: &Arc<Settings>) -> TransformExecutor {
        let generator = TemplateGenerator::new(TemplateCatalog::new(&settings.migrations_dir));
        TransformExecutor::new(settings.clone(), Arc::new(generator))
    }

    #[tokio::test]
    async fn test_transform_applies_chain_in_own_database() {
        let (_dir, settings) = project();
        let extracted = vec![("roads".to_string(), snapshot(&settings, "roads"))];

        let result = executor(&settings)
            .run_parallel_transform(&extracted, &[], Phases::all(), 2)
            .await;

        assert!(result.success(), "{:?}", result.failed);
        assert_eq!(result.templates_applied, 2);
        let (id, db_path) = &result.succeeded[0];
        assert_eq!(id, "roads");
        assert_eq!(db_path, &settings.temp_db_path("roads"));

        let db = Database::open(db_path).unwrap();
        assert_eq!(db.column_names("raw", "roads").unwrap(), vec!["id", "geom"]);
        assert_eq!(db.row_count("staging_004", "roads").unwrap(), 3);
        assert_eq!(db.row_count("mart", "roads").unwrap(), 3);
        let migrator = Migrator::new(&db, &settings.migrations_dir).unwrap();
        assert!(migrator.is_template_applied("004", "roads").unwrap());
        assert!(migrator.is_template_applied("010", "roads").unwrap());
        assert!(migrator.applied_versions().unwrap().contains("001"));
    }

    #[tokio::test]
    async fn test_phase_filter() {
        let (_dir, settings) = project();
        let extracted = vec![("roads".to_string(), snapshot(&settings, "roads"))];

        let result = executor(&settings)
            .run_parallel_transform(&extracted, &[], Phases::only(&[Phase::Staging]), 1)
            .await;

        assert_eq!(result.templates_applied, 1);
        let db = Database::open(&settings.temp_db_path("roads")).unwrap();
        assert!(db.table_exists("staging_004", "roads").unwrap());
        assert!(!db.table_exists("mart", "roads").unwrap());
    }

    #[tokio::test]
    async fn test_missing_snapshot_fails_only_that_dataset() {
        let (_dir, settings) = project();
        let extracted = vec![
            ("a".to_string(), snapshot(&settings, "a")),
            ("b".to_string(), settings.snapshot_path("b")),
        ];

        let result = executor(&settings)
            .run_parallel_transform(&extracted, &[], Phases::all(), 2)
            .await;

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].0, "a");
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, "b");
        assert!(result.failed[0].1.contains("Snapshot for 'b' not found"));
    }

    #[tokio::test]
    async fn test_rerun_skips_applied_unless_forced() {
        let (_dir, settings) = project();
        let extracted = vec![("roads".to_string(), snapshot(&settings, "roads"))];

        let first = executor(&settings)
            .run_parallel_transform(&extracted, &[], Phases::all(), 1)
            .await;
        assert_eq!(first.templates_applied, 2);

        let again = executor(&settings)
            .run_parallel_transform(&extracted, &[], Phases::all(), 1)
            .await;
        assert!(again.success());
        assert_eq!(again.templates_applied, 0);
        assert_eq!(again.templates_skipped, 2);

        let forced = executor(&settings)
            .with_force(true)
            .run_parallel_transform(&extracted, &[], Phases::all(), 1)
            .await;
        assert_eq!(forced.templates_applied, 2);
    }

    #[tokio::test]
    async fn test_bad_template_reports_template() {
        let (_dir, settings) = project();
        std::fs::write(
            settings.migrations_dir.join("011_mart_broken_template.sql"),
            "SELECT * FROM no_such_table_{{ dataset_id }};",
        )
        .unwrap();
        let extracted = vec![("roads".to_string(), snapshot(&settings, "roads"))];

        let result = executor(&settings)
            .run_parallel_transform(&extracted, &[], Phases::all(), 1)
            .await;

        assert!(result.succeeded.is_empty());
        assert!(result.failed[0].1.contains("011_mart_broken_template.sql"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, settings) = project();
        let extracted = vec![("roads".to_string(), snapshot(&settings, "roads"))];
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let result = executor(&settings)
            .with_cancellation(cancel)
            .run_parallel_transform(&extracted, &[], Phases::all(), 1)
            .await;
        assert_eq!(result.skipped, vec!["roads"]);
        assert!(!settings.temp_db_path("roads").exists());
    }

    #[test]
    fn test_remove_db_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.duckdb");
        std::fs::write(&path, b"db").unwrap();
        std::fs::write(dir.path().join("x.duckdb.wal"), b"wal").unwrap();
        remove_db_files(&path).unwrap();
        assert!(!path.exists());
        assert!(!dir.path().join("x.duckdb.wal").exists());
        remove_db_files(&path).unwrap();
    }
}
