//! Sequential merge of ephemeral databases into the warehouse
//!
//! The warehouse has a single writer: ephemeral databases are attached one
//! at a time, their tables copied with `CREATE OR REPLACE`, then detached.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{MergeError, MergeResult};
use crate::db::{Database, quote_ident};
use crate::event::{EventSink, PipelineEvent, emit};
use crate::ledger::{MIGRATIONS_TABLE, Migrator};
use crate::sink::{LogSink, log_line};
use crate::templates::{MART_SCHEMA, RAW_SCHEMA};
use crate::transform::remove_db_files;

const PHASE: &str = "merge";

/// Alias an ephemeral database is attached under
pub const MERGE_ALIAS: &str = "temp_db";

/// Outcome of a merge phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// True when every dataset merged
    pub success: bool,
    /// Datasets merged, in input order
    pub merged: Vec<String>,
    /// `(dataset id, error text)`
    pub failed: Vec<(String, String)>,
    /// Tables copied into the warehouse
    pub tables: usize,
    /// Ephemeral files deleted afterwards
    pub removed_files: usize,
}

/// Whether tables of a schema are merged into the warehouse
pub fn is_merge_schema(schema: &str) -> bool {
    schema == RAW_SCHEMA || schema == MART_SCHEMA || schema == "staging" || schema.starts_with("staging_")
}

/// Merges ephemeral databases into one warehouse
pub struct MergeCoordinator<'a> {
    warehouse: &'a Database,
    events: Option<EventSink>,
    sink: Option<LogSink>,
}

impl<'a> MergeCoordinator<'a> {
    pub fn new(warehouse: &'a Database) -> Self {
        Self {
            warehouse,
            events: None,
            sink: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_sink(mut self, sink: Option<LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Merge every `(dataset id, ephemeral path)` pair, then delete the files
    ///
    /// A failed dataset clears `success` but never stops the remaining merges.
    pub fn merge_databases(&self, pairs: &[(String, PathBuf)]) -> MergeReport {
        let total = pairs.len();
        let mut report = MergeReport::default();
        if pairs.is_empty() {
            report.success = true;
            return report;
        }

        info!(datasets = total, "Starting merge");
        log_line(
            self.sink.as_ref(),
            format!("Merging {total} database(s) into the warehouse"),
        );
        emit(
            self.events.as_ref(),
            PipelineEvent::started(PHASE, format!("Merging {total} databases")).with_progress(0.0),
        );

        for (index, (id, path)) in pairs.iter().enumerate() {
            let fraction = (index + 1) as f64 / total as f64;
            match self.merge_one(id, path) {
                Ok(tables) => {
                    info!(dataset = %id, tables, "Merged");
                    log_line(self.sink.as_ref(), format!("  ✓ {id}: {tables} table(s)"));
                    emit(
                        self.events.as_ref(),
                        PipelineEvent::progress(PHASE, format!("Merged {id}"))
                            .for_dataset(id)
                            .with_progress(fraction),
                    );
                    report.tables += tables;
                    report.merged.push(id.clone());
                }
                Err(e) => {
                    warn!(dataset = %id, error = %e, "Merge failed");
                    log_line(self.sink.as_ref(), format!("  ✗ {id}: {e}"));
                    emit(
                        self.events.as_ref(),
                        PipelineEvent::failed(PHASE, e.to_string())
                            .for_dataset(id)
                            .with_progress(fraction),
                    );
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        for (id, path) in pairs {
            match remove_db_files(path) {
                Ok(()) => report.removed_files += 1,
                Err(e) => {
                    warn!(dataset = %id, path = %path.display(), error = %e, "Ephemeral database locked, left in place")
                }
            }
        }

        report.success = report.failed.is_empty();
        log_line(
            self.sink.as_ref(),
            format!(
                "Merged {}/{} database(s), {} table(s)",
                report.merged.len(),
                total,
                report.tables
            ),
        );
        let done = if report.success {
            PipelineEvent::completed(PHASE, format!("Merged {} databases", report.merged.len()))
        } else {
            PipelineEvent::failed(
                PHASE,
                format!("{} of {} merges failed", report.failed.len(), total),
            )
        };
        emit(self.events.as_ref(), done.with_progress(1.0));
        report
    }

    /// Merge one ephemeral database, returning the number of tables copied
    pub fn merge_one(&self, dataset_id: &str, path: &Path) -> MergeResult<usize> {
        if !path.is_file() {
            return Err(MergeError::MissingDatabase {
                dataset: dataset_id.to_string(),
                path: path.to_path_buf(),
            });
        }

        self.warehouse
            .attach_read_only(path, MERGE_ALIAS)
            .map_err(|e| MergeError::Attach {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let copied = self.copy_attached(dataset_id);

        if let Err(e) = self.warehouse.detach(MERGE_ALIAS) {
            warn!(dataset = dataset_id, error = %e, "Detach failed");
        }
        copied
    }

    fn copy_attached(&self, dataset_id: &str) -> MergeResult<usize> {
        let schemas: Vec<String> = self
            .warehouse
            .attached_schema_names(MERGE_ALIAS)?
            .into_iter()
            .filter(|s| is_merge_schema(s))
            .collect();

        let mut tables = 0;
        for schema in &schemas {
            let names = self.warehouse.attached_table_names(MERGE_ALIAS, schema)?;
            if names.is_empty() {
                continue;
            }
            self.warehouse.create_schemas(&[schema.as_str()])?;
            for table in names {
                let sql = format!(
                    "CREATE OR REPLACE TABLE {schema_q}.{table_q} AS SELECT * FROM {alias}.{schema_q}.{table_q};",
                    schema_q = quote_ident(schema),
                    table_q = quote_ident(&table),
                    alias = quote_ident(MERGE_ALIAS),
                );
                self.warehouse
                    .execute_batch(&sql)
                    .map_err(|e| MergeError::Copy {
                        dataset: dataset_id.to_string(),
                        schema: schema.clone(),
                        table: table.clone(),
                        message: e.to_string(),
                    })?;
                debug!(dataset = dataset_id, schema = %schema, table = %table, "Table copied");
                tables += 1;
            }
        }

        self.copy_template_ledger()?;
        Ok(tables)
    }

    // Per-dataset template rows follow the data into the warehouse ledger.
    fn copy_template_ledger(&self) -> MergeResult<()> {
        let attached = self.warehouse.attached_table_names(MERGE_ALIAS, "main")?;
        if !attached.iter().any(|t| t == MIGRATIONS_TABLE) {
            return Ok(());
        }
        self.warehouse.execute_batch(&format!(
            "INSERT OR REPLACE INTO {MIGRATIONS_TABLE} (version, name, applied_at, checksum) \
             SELECT version, name, applied_at, checksum FROM {alias}.main.{MIGRATIONS_TABLE} \
             WHERE version LIKE '%:%';",
            alias = quote_ident(MERGE_ALIAS),
        ))?;
        Ok(())
    }
}

/// Ensure the warehouse has a ledger table before merging
pub fn prepare_warehouse(warehouse: &Database, migrations_dir: &Path) -> MergeResult<()> {
    Migrator::new(warehouse, migrations_dir)?;
    warehouse.create_schemas(&[RAW_SCHEMA, MART_SCHEMA])?;
    Ok(())
}

/// Delete every `*.duckdb` and `*.duckdb.wal` file in the temp directory
///
/// Files that cannot be removed (typically locked) are logged and skipped.
/// Returns `(removed, skipped)`.
pub fn cleanup_temp_dbs(temp_dir: &Path) -> (usize, usize) {
    let mut removed = 0;
    let mut skipped = 0;
    for suffix in ["*.duckdb", "*.duckdb.wal"] {
        let pattern = temp_dir.join(suffix).to_string_lossy().into_owned();
        let Ok(paths) = glob::glob(&pattern) else {
            continue;
        };
        for path in paths.filter_map(Result::ok) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not remove temp database");
                    skipped += 1;
                }
            }
        }
    }
    (removed, skipped)
}
