//! The extractor capability

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cache::{DownloadCache, DownloadProgress, format_bytes};
use super::error::ExtractError;
use crate::catalog::DatasetConfig;
use crate::db::{Database, DbError, DbResult, quote_ident, quote_literal};
use crate::event::{EventSink, PipelineEvent, emit};
use crate::settings::Settings;
use crate::sink::{LogSink, log_line};
use crate::templates::RAW_SCHEMA;

/// Database handle shared between an extractor and the snapshot adapter
///
/// DuckDB connections are not `Sync`; access goes through the mutex on a
/// blocking thread (see [`with_db`]).
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Outcome of extracting one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractResult {
    pub success: bool,
    pub rows: u64,
    pub message: String,
    pub snapshot_path: Option<PathBuf>,
}

impl ExtractResult {
    pub fn ok(rows: u64, message: impl Into<String>) -> Self {
        Self {
            success: true,
            rows,
            message: message.into(),
            snapshot_path: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            rows: 0,
            message: message.into(),
            snapshot_path: None,
        }
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}

/// Everything an extractor may use besides the dataset itself
#[derive(Clone)]
pub struct ExtractContext {
    /// Shared download cache for remote sources
    pub cache: Arc<DownloadCache>,
    /// Per-call timeout enforced by the scheduler
    pub timeout: Duration,
    /// Extensions loaded into throwaway databases
    pub extensions: Vec<String>,
    /// Human-readable progress lines
    pub sink: Option<LogSink>,
    /// Download progress events
    pub events: Option<EventSink>,
}

impl std::fmt::Debug for ExtractContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractContext")
            .field("cache", &self.cache)
            .field("timeout", &self.timeout)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl ExtractContext {
    pub fn new(cache: Arc<DownloadCache>) -> Self {
        Self {
            cache,
            timeout: Duration::from_secs(300),
            extensions: Vec::new(),
            sink: None,
            events: None,
        }
    }

    /// Context configured from engine settings, caching downloads under the temp dir
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cache: Arc::new(DownloadCache::new(settings.temp_dir.join("downloads"))),
            timeout: settings.extract_timeout,
            extensions: settings.extensions.clone(),
            sink: None,
            events: None,
        }
    }

    pub fn with_sink(mut self, sink: Option<LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: Option<EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Send a line to the log sink
    pub fn log(&self, line: impl AsRef<str>) {
        log_line(self.sink.as_ref(), line);
    }

    /// Download a remote source through the shared cache
    ///
    /// Byte progress is reported as `extract` progress events for `dataset_id`.
    pub async fn download(&self, dataset_id: &str, url: &str) -> Result<PathBuf, ExtractError> {
        let progress = self.events.clone().map(|events| {
            let id = dataset_id.to_string();
            let report: DownloadProgress = Arc::new(move |written, total| {
                emit(Some(&events), download_event(&id, written, total));
            });
            report
        });
        self.cache.download(url, progress).await
    }
}

fn download_event(dataset_id: &str, written: u64, total: Option<u64>) -> PipelineEvent {
    let message = match total {
        Some(total) => format!(
            "downloading {} / {} ({}%)",
            format_bytes(written),
            format_bytes(total),
            written.saturating_mul(100) / total.max(1)
        ),
        None => format!("downloading {}", format_bytes(written)),
    };
    PipelineEvent::progress("extract", message).for_dataset(dataset_id)
}

/// A source connector
///
/// `extract` loads the dataset into `raw.{id}` of the given database.
/// `extract_to_snapshot` wraps it with a throwaway in-memory database and
/// writes the table out as `{output_dir}/{id}.parquet`.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Load the dataset into `raw.{id}`
    async fn extract(
        &self,
        dataset: &DatasetConfig,
        ctx: &ExtractContext,
        db: SharedDatabase,
    ) -> Result<ExtractResult, ExtractError>;

    /// Extract into a fresh database and copy the result out as parquet
    async fn extract_to_snapshot(
        &self,
        dataset: &DatasetConfig,
        ctx: &ExtractContext,
        output_dir: &Path,
    ) -> Result<ExtractResult, ExtractError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ExtractError::io(output_dir, e))?;

        let extensions = ctx.extensions.clone();
        let db = tokio::task::spawn_blocking(move || -> DbResult<Database> {
            let db = Database::memory()?;
            db.load_extensions(&extensions);
            db.create_schemas(&[RAW_SCHEMA])?;
            Ok(db)
        })
        .await
        .map_err(|e| ExtractError::Task(e.to_string()))??;
        let db: SharedDatabase = Arc::new(Mutex::new(db));

        let result = self.extract(dataset, ctx, db.clone()).await?;
        if !result.success {
            return Ok(result);
        }

        let path = snapshot_file(output_dir, &dataset.id);
        let table = dataset.id.clone();
        let target = path.clone();
        let rows = with_db(&db, move |db| write_snapshot(db, &table, &target)).await?;
        debug!(dataset = %dataset.id, rows, path = %path.display(), "Snapshot written");

        Ok(ExtractResult {
            success: true,
            rows,
            message: result.message,
            snapshot_path: Some(path),
        })
    }
}

/// Snapshot file of a dataset inside `dir`
pub fn snapshot_file(dir: &Path, dataset_id: &str) -> PathBuf {
    dir.join(format!("{dataset_id}.parquet"))
}

/// Run blocking database work on a blocking thread
pub async fn with_db<T, F>(db: &SharedDatabase, f: F) -> Result<T, ExtractError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let guard = db
            .lock()
            .map_err(|_| ExtractError::Source("database lock poisoned".to_string()))?;
        f(&guard).map_err(ExtractError::from)
    })
    .await
    .map_err(|e| ExtractError::Task(e.to_string()))?
}

/// `CREATE OR REPLACE TABLE raw.{id} AS {select}` and return the row count
pub fn load_raw_table(db: &Database, dataset_id: &str, select: &str) -> DbResult<u64> {
    db.create_schemas(&[RAW_SCHEMA])?;
    db.execute_batch(&format!(
        "CREATE OR REPLACE TABLE {}.{} AS {select};",
        RAW_SCHEMA,
        quote_ident(dataset_id)
    ))?;
    Ok(db.row_count(RAW_SCHEMA, dataset_id)?.max(0) as u64)
}

// Written to a sibling temp file first so a failed COPY never leaves a
// truncated snapshot under the final name.
fn write_snapshot(db: &Database, dataset_id: &str, path: &Path) -> DbResult<u64> {
    if !db.table_exists(RAW_SCHEMA, dataset_id)? {
        return Err(DbError::Database(format!(
            "extractor did not create {RAW_SCHEMA}.{dataset_id}"
        )));
    }
    let partial = path.with_extension("parquet.partial");
    db.execute_batch(&format!(
        "COPY {}.{} TO {} (FORMAT PARQUET);",
        RAW_SCHEMA,
        quote_ident(dataset_id),
        quote_literal(&partial.to_string_lossy())
    ))?;
    std::fs::rename(&partial, path)?;
    Ok(db.row_count(RAW_SCHEMA, dataset_id)?.max(0) as u64)
}
