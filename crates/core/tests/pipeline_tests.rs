//! End-to-end tests for the pipeline runner
//!
//! extract → transform → merge → post-merge against temporary projects, with
//! in-process extractors standing in for remote sources.

#![cfg(feature = "engine")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use getl_core::catalog::DatasetConfig;
use getl_core::db::Database;
use getl_core::event::{EventKind, collecting_events};
use getl_core::extract::{
    ExtractContext, ExtractError, ExtractResult, ExtractScheduler, Extractor, ExtractorRegistry,
    SharedDatabase, load_raw_table, with_db,
};
use getl_core::pipeline::{Phase, PipelineRunner, RunMode, RunOptions};
use getl_core::settings::Settings;
use getl_core::sink::collecting_sink;

/// Loads a fixed two-row table, or fails for datasets with `fail: true`
struct FixtureExtractor;

#[async_trait]
impl Extractor for FixtureExtractor {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn extract(
        &self,
        dataset: &DatasetConfig,
        _ctx: &ExtractContext,
        db: SharedDatabase,
    ) -> Result<ExtractResult, ExtractError> {
        if dataset.extra_str("fail").as_deref() == Some("true") {
            return Err(ExtractError::Source(format!("{} is unreachable", dataset.id)));
        }
        let id = dataset.id.clone();
        let rows = with_db(&db, move |db| {
            load_raw_table(
                db,
                &id,
                "SELECT * FROM (VALUES (1, 'POINT (1 1)'), (2, 'POINT (2 2)')) AS t(id, geometry)",
            )
        })
        .await?;
        Ok(ExtractResult::ok(rows, format!("{rows} rows")))
    }
}

/// Records the highest number of extractions running at once
struct CountingExtractor {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Extractor for CountingExtractor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn extract(
        &self,
        dataset: &DatasetConfig,
        _ctx: &ExtractContext,
        db: SharedDatabase,
    ) -> Result<ExtractResult, ExtractError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let id = dataset.id.clone();
        let rows = with_db(&db, move |db| load_raw_table(db, &id, "SELECT 1 AS id")).await?;
        Ok(ExtractResult::ok(rows, "ok"))
    }
}

fn project() -> (TempDir, Settings) {
    let dir = TempDir::new().expect("temp dir");
    let settings = Settings::new(dir.path())
        .with_extensions(Vec::new())
        .with_max_concurrent_extracts(2)
        .with_max_concurrent_sql(2);
    let migrations = &settings.migrations_dir;
    std::fs::create_dir_all(migrations).unwrap();
    std::fs::write(
        migrations.join("001_init.sql"),
        "-- migrate:up\nCREATE SCHEMA IF NOT EXISTS meta;\nCREATE TABLE IF NOT EXISTS meta.run_log (note VARCHAR);\n-- migrate:down\nDROP TABLE IF EXISTS meta.run_log;\n",
    )
    .unwrap();
    std::fs::write(
        migrations.join("004_staging_base_template.sql"),
        "-- migrate:up\nCREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT id, geom FROM {{ prev_schema }}.{{ dataset_id }};\n",
    )
    .unwrap();
    std::fs::write(
        migrations.join("010_mart_out_template.sql"),
        "-- migrate:up\nCREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT id, geom, '{{ dataset_id }}' AS source FROM {{ prev_schema }}.{{ dataset_id }};\n",
    )
    .unwrap();
    std::fs::write(
        migrations.join("020_summary_merged.sql"),
        "-- migrate:up\nCREATE OR REPLACE TABLE mart.summary AS SELECT 'done' AS status;\n",
    )
    .unwrap();
    (dir, settings)
}

fn fixture_registry() -> ExtractorRegistry {
    let mut registry = ExtractorRegistry::new();
    registry.register_shared("fixture", Arc::new(FixtureExtractor));
    registry
}

fn datasets(ids: &[&str], failing: &[&str]) -> Vec<DatasetConfig> {
    ids.iter()
        .map(|id| {
            let dataset = DatasetConfig::new(*id, "fixture");
            if failing.contains(id) {
                dataset.with_extra("fail", "true")
            } else {
                dataset
            }
        })
        .collect()
}

fn ledger_versions(db: &Database) -> Vec<String> {
    db.query("SELECT version FROM _migrations ORDER BY version")
        .unwrap()
        .into_iter()
        .filter_map(|row| row["version"].as_str().map(String::from))
        .collect()
}

#[tokio::test]
async fn test_full_run_isolates_failed_dataset() {
    let (_dir, settings) = project();
    let warehouse = settings.warehouse_path.clone();
    let temp_dir = settings.temp_dir.clone();

    let runner = PipelineRunner::new(settings, fixture_registry()).unwrap();
    let (sink, lines) = collecting_sink();
    let report = runner
        .run(&datasets(&["alpha", "beta", "gamma"], &["beta"]), &RunOptions::new(), Some(sink))
        .await
        .unwrap();

    assert_eq!(report.datasets_extracted, 2);
    assert_eq!(report.datasets_failed, 1);
    assert_eq!(report.datasets_transformed, 2);
    assert_eq!(report.failures[0].dataset, "beta");
    assert_eq!(report.failures[0].phase, "extract");
    assert!(report.merge_success);
    assert!(report.post_merge_success);
    assert!(!report.is_success());

    let db = Database::open(&warehouse).unwrap();
    assert_eq!(
        db.table_names("mart").unwrap(),
        vec!["alpha", "gamma", "summary"]
    );
    assert_eq!(db.row_count("mart", "alpha").unwrap(), 2);
    assert!(db.column_names("mart", "gamma").unwrap().contains(&"geom".to_string()));
    assert!(db.table_exists("staging_004", "alpha").unwrap());

    let versions = ledger_versions(&db);
    assert!(versions.contains(&"001".to_string()));
    assert!(versions.contains(&"010:alpha".to_string()));
    assert!(!versions.iter().any(|v| v.ends_with(":beta")));

    let leftovers: Vec<_> = std::fs::read_dir(&temp_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "duckdb"))
        .collect();
    assert!(leftovers.is_empty());

    assert!(lines.lock().unwrap().iter().any(|l| l.contains("Failed:      1")));
}

#[tokio::test]
async fn test_extract_only_leaves_snapshots() {
    let (_dir, settings) = project();
    let raw_dir = settings.raw_dir.clone();
    let warehouse = settings.warehouse_path.clone();

    let runner = PipelineRunner::new(settings, fixture_registry()).unwrap();
    let options = RunOptions::new().with_mode(RunMode::ExtractOnly);
    let report = runner
        .run(&datasets(&["alpha", "beta"], &[]), &options, None)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.datasets_extracted, 2);
    assert_eq!(report.datasets_transformed, 0);
    assert!(raw_dir.join("alpha.parquet").is_file());
    assert!(raw_dir.join("beta.parquet").is_file());
    assert!(!warehouse.exists());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let (_dir, settings) = project();
    let warehouse = settings.warehouse_path.clone();
    let runner = PipelineRunner::new(settings, fixture_registry()).unwrap();
    let selection = datasets(&["alpha", "gamma"], &[]);

    let first = runner.run(&selection, &RunOptions::new(), None).await.unwrap();
    let second = runner.run(&selection, &RunOptions::new(), None).await.unwrap();

    assert!(first.is_success());
    assert!(second.is_success());
    let db = Database::open(&warehouse).unwrap();
    assert_eq!(db.row_count("mart", "alpha").unwrap(), 2);
    assert_eq!(db.row_count("mart", "gamma").unwrap(), 2);
}

#[tokio::test]
async fn test_phase_filter_skips_mart() {
    let (_dir, settings) = project();
    let warehouse = settings.warehouse_path.clone();
    let runner = PipelineRunner::new(settings, fixture_registry()).unwrap();
    let options = RunOptions::new().with_phases(&[Phase::Staging]);

    let report = runner
        .run(&datasets(&["alpha"], &[]), &options, None)
        .await
        .unwrap();

    assert!(report.is_success());
    let db = Database::open(&warehouse).unwrap();
    assert!(db.table_exists("staging_004", "alpha").unwrap());
    assert!(!db.table_exists("mart", "alpha").unwrap());
}

#[tokio::test]
async fn test_pipeline_events_bracket_the_run() {
    let (_dir, settings) = project();
    let (events, captured) = collecting_events();
    let runner = PipelineRunner::new(settings, fixture_registry())
        .unwrap()
        .with_events(events);

    runner
        .run(&datasets(&["alpha"], &[]), &RunOptions::new(), None)
        .await
        .unwrap();

    let events = captured.lock().unwrap();
    let first = events.first().unwrap();
    let last = events.last().unwrap();
    assert_eq!((first.phase.as_str(), first.kind), ("pipeline", EventKind::Started));
    assert_eq!((last.phase.as_str(), last.kind), ("pipeline", EventKind::Completed));
    for phase in ["extract", "transform", "merge"] {
        assert!(events.iter().any(|e| e.phase == phase), "no {phase} events");
    }
}

#[tokio::test]
async fn test_extraction_respects_concurrency_bound() {
    let dir = TempDir::new().unwrap();
    let counting = Arc::new(CountingExtractor {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let mut registry = ExtractorRegistry::new();
    registry.register_shared("counting", counting.clone());

    let ctx = ExtractContext::from_settings(&Settings::new(dir.path()).with_extensions(Vec::new()));
    let scheduler = ExtractScheduler::new(registry, ctx, dir.path().join("raw"));
    let selection: Vec<DatasetConfig> = (0..8)
        .map(|i| DatasetConfig::new(format!("ds_{i}"), "counting"))
        .collect();

    let result = scheduler.run_parallel_extract(&selection, 3).await;

    assert!(result.success);
    assert_eq!(result.total(), selection.len());
    assert!(counting.peak.load(Ordering::SeqCst) <= 3);
    assert!(counting.peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_every_dataset_accounted_for() {
    let dir = TempDir::new().unwrap();
    let ctx = ExtractContext::from_settings(&Settings::new(dir.path()).with_extensions(Vec::new()));
    let scheduler = ExtractScheduler::new(fixture_registry(), ctx, dir.path().join("raw"));
    let mut selection = datasets(&["a", "b", "c", "d"], &["b", "d"]);
    selection.push(DatasetConfig::new("e", "no_such_plugin"));

    let result = scheduler.run_parallel_extract(&selection, 2).await;

    assert_eq!(result.succeeded.len() + result.failed.len(), selection.len());
    let failed: Vec<&str> = result.failed.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(failed, vec!["b", "d", "e"]);
    assert!(!result.success);
}

/// Shared `004` staging plus a `p` pipeline with two staging steps and a mart step
///
/// Every template records the schema it read from in a `src_*` column.
fn pipeline_project() -> (TempDir, Settings) {
    let dir = TempDir::new().expect("temp dir");
    let settings = Settings::new(dir.path())
        .with_extensions(Vec::new())
        .with_max_concurrent_sql(2);
    let migrations = &settings.migrations_dir;
    let scoped = migrations.join("aab_p");
    std::fs::create_dir_all(&scoped).unwrap();
    std::fs::write(
        migrations.join("004_staging_base_template.sql"),
        "-- migrate:up\nCREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT id, geom, '{{ prev_schema }}' AS src_004 FROM {{ prev_schema }}.{{ dataset_id }};\n",
    )
    .unwrap();
    std::fs::write(
        scoped.join("001_staging_clean_template.sql"),
        "-- migrate:up\nCREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT *, '{{ prev_schema }}' AS src_001 FROM {{ prev_schema }}.{{ dataset_id }};\n",
    )
    .unwrap();
    std::fs::write(
        scoped.join("002_staging_classify_template.sql"),
        "-- migrate:up\nCREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT *, '{{ prev_schema }}' AS src_002 FROM {{ prev_schema }}.{{ dataset_id }};\n",
    )
    .unwrap();
    std::fs::write(
        scoped.join("003_mart_export_template.sql"),
        "-- migrate:up\nCREATE OR REPLACE TABLE {{ schema }}.{{ dataset_id }} AS SELECT *, '{{ prev_schema }}' AS src_mart FROM {{ prev_schema }}.{{ dataset_id }};\n",
    )
    .unwrap();
    (dir, settings)
}

fn single_value(db: &Database, sql: &str) -> String {
    let rows = db.query(sql).unwrap();
    rows[0]
        .as_object()
        .and_then(|row| row.values().next())
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap()
}

#[tokio::test]
async fn test_pipeline_scoped_chain_end_to_end() {
    let (_dir, settings) = pipeline_project();
    let warehouse = settings.warehouse_path.clone();

    let selection = vec![
        DatasetConfig::new("skog", "fixture").with_pipeline("p"),
        DatasetConfig::new("vagar", "fixture"),
    ];
    let runner = PipelineRunner::new(settings, fixture_registry()).unwrap();
    let report = runner.run(&selection, &RunOptions::new(), None).await.unwrap();

    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.datasets_transformed, 2);

    let db = Database::open(&warehouse).unwrap();
    assert_eq!(
        single_value(&db, "SELECT DISTINCT src_004 FROM staging_004.skog"),
        "raw"
    );
    assert_eq!(
        single_value(&db, "SELECT DISTINCT src_001 FROM staging_p_001.skog"),
        "staging_004"
    );
    assert_eq!(
        single_value(&db, "SELECT DISTINCT src_002 FROM staging_p_002.skog"),
        "staging_p_001"
    );
    assert_eq!(
        single_value(&db, "SELECT DISTINCT src_mart FROM mart.skog"),
        "staging_p_002"
    );
    assert_eq!(db.row_count("mart", "skog").unwrap(), 2);

    // Datasets outside the pipeline only get shared templates
    assert_eq!(db.table_names("mart").unwrap(), vec!["skog"]);
    assert!(db.table_exists("staging_004", "vagar").unwrap());
    assert!(!db.table_exists("staging_p_001", "vagar").unwrap());

    let versions = ledger_versions(&db);
    for expected in ["004:skog", "aab_p/001:skog", "aab_p/002:skog", "aab_p/003:skog", "004:vagar"] {
        assert!(versions.contains(&expected.to_string()), "missing {expected} in {versions:?}");
    }
    assert!(!versions.iter().any(|v| v.starts_with("aab_p/") && v.ends_with(":vagar")));
}
