//! Engine settings
//!
//! A single immutable [`Settings`] value is built at process start and passed
//! into every component. Per-run overrides are expressed with the `with_*`
//! builder methods rather than by mutating shared state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the project root
pub const ENV_ROOT: &str = "GETL_ROOT";
/// Environment variable overriding the extraction concurrency bound
pub const ENV_MAX_EXTRACTS: &str = "GETL_MAX_EXTRACTS";
/// Environment variable overriding the SQL concurrency bound
pub const ENV_MAX_SQL: &str = "GETL_MAX_SQL";
/// Environment variable overriding how many run logs are kept (0 keeps all)
pub const ENV_MAX_LOG_FILES: &str = "GETL_MAX_LOG_FILES";

/// Run logs kept by default
pub const DEFAULT_MAX_LOG_FILES: usize = 20;

/// Canonical name of the geometry column after normalization
pub const CANONICAL_GEOMETRY: &str = "geom";

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Project root
    pub root: PathBuf,
    /// Data directory (warehouse, snapshots, temp databases)
    pub data_dir: PathBuf,
    /// Snapshot directory, one parquet file per extracted dataset
    pub raw_dir: PathBuf,
    /// Directory for ephemeral per-dataset databases
    pub temp_dir: PathBuf,
    /// SQL root
    pub sql_dir: PathBuf,
    /// Configuration directory
    pub config_dir: PathBuf,
    /// Log directory
    pub logs_dir: PathBuf,
    /// Shared warehouse database file
    pub warehouse_path: PathBuf,
    /// Migration and template root
    pub migrations_dir: PathBuf,
    /// Dataset definition file
    pub datasets_file: PathBuf,
    /// Concurrency bound for extraction
    pub max_concurrent_extracts: usize,
    /// Concurrency bound for SQL transforms
    pub max_concurrent_sql: usize,
    /// Per-call extraction timeout
    pub extract_timeout: Duration,
    /// DuckDB extensions loaded into every database (best effort)
    pub extensions: Vec<String>,
    /// Alternate geometry column names renamed to `geom`
    pub geometry_aliases: Vec<String>,
    /// Boundary schema used when no shared staging template exists
    pub shared_staging_boundary: String,
    /// Newest run logs kept in `logs_dir`; `None` disables rotation
    pub max_log_files: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(".")
    }
}

impl Settings {
    /// Create settings rooted at `root` with default layout and limits
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let data_dir = root.join("data");
        let sql_dir = root.join("sql");
        let config_dir = root.join("config");
        let cpus = available_cpus();

        Self {
            raw_dir: data_dir.join("raw"),
            temp_dir: data_dir.join("temp"),
            warehouse_path: data_dir.join("warehouse.duckdb"),
            migrations_dir: sql_dir.join("migrations"),
            datasets_file: config_dir.join("datasets.yml"),
            logs_dir: root.join("logs"),
            data_dir,
            sql_dir,
            config_dir,
            root,
            max_concurrent_extracts: cpus,
            max_concurrent_sql: (cpus / 2).max(2),
            extract_timeout: Duration::from_secs(300),
            extensions: ["spatial", "parquet", "httpfs", "json", "h3"]
                .into_iter()
                .map(String::from)
                .collect(),
            geometry_aliases: ["geometry", "shape", "geometri"]
                .into_iter()
                .map(String::from)
                .collect(),
            shared_staging_boundary: "staging_004".to_string(),
            max_log_files: Some(DEFAULT_MAX_LOG_FILES),
        }
    }

    /// Create settings from the environment
    ///
    /// Reads `GETL_ROOT` (default: current directory), `GETL_MAX_EXTRACTS`,
    /// `GETL_MAX_SQL` and `GETL_MAX_LOG_FILES`. Unparseable numbers are ignored.
    pub fn from_env() -> Self {
        let root = std::env::var(ENV_ROOT).unwrap_or_else(|_| ".".to_string());
        let mut settings = Self::new(root);

        if let Some(n) = env_usize(ENV_MAX_EXTRACTS) {
            settings = settings.with_max_concurrent_extracts(n);
        }
        if let Some(n) = env_usize(ENV_MAX_SQL) {
            settings = settings.with_max_concurrent_sql(n);
        }
        if let Some(n) = env_usize(ENV_MAX_LOG_FILES) {
            settings = settings.with_max_log_files((n > 0).then_some(n));
        }
        settings
    }

    /// Override the warehouse database path
    pub fn with_warehouse(mut self, path: impl Into<PathBuf>) -> Self {
        self.warehouse_path = path.into();
        self
    }

    /// Override the migration/template root
    pub fn with_migrations_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.migrations_dir = path.into();
        self
    }

    /// Override the dataset definition file
    pub fn with_datasets_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.datasets_file = path.into();
        self
    }

    /// Override the configuration directory (and the dataset file inside it)
    pub fn with_config_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_dir = path.into();
        self.datasets_file = self.config_dir.join("datasets.yml");
        self
    }

    /// Set the extraction concurrency bound
    pub fn with_max_concurrent_extracts(mut self, n: usize) -> Self {
        self.max_concurrent_extracts = n;
        self
    }

    /// Set the SQL concurrency bound
    pub fn with_max_concurrent_sql(mut self, n: usize) -> Self {
        self.max_concurrent_sql = n;
        self
    }

    /// Set the extraction timeout
    pub fn with_extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }

    /// Set how many run logs are kept
    pub fn with_max_log_files(mut self, max: Option<usize>) -> Self {
        self.max_log_files = max;
        self
    }

    /// Replace the extension list
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Path of the snapshot file for a dataset
    pub fn snapshot_path(&self, dataset_id: &str) -> PathBuf {
        self.raw_dir.join(format!("{dataset_id}.parquet"))
    }

    /// Path of the ephemeral database for a dataset
    pub fn temp_db_path(&self, dataset_id: &str) -> PathBuf {
        self.temp_dir.join(format!("{dataset_id}.duckdb"))
    }

    /// Create every directory the engine writes into
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.data_dir,
            &self.raw_dir,
            &self.temp_dir,
            &self.sql_dir,
            &self.config_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_extracts == 0 {
            return Err("max_concurrent_extracts must be at least 1".to_string());
        }
        if self.max_concurrent_sql == 0 {
            return Err("max_concurrent_sql must be at least 1".to_string());
        }
        if self.extract_timeout.is_zero() {
            return Err("extract_timeout must be greater than zero".to_string());
        }
        if self.shared_staging_boundary.is_empty() {
            return Err("shared_staging_boundary must not be empty".to_string());
        }
        Ok(())
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_layout() {
        let settings = Settings::new("/srv/getl");
        assert_eq!(settings.raw_dir, PathBuf::from("/srv/getl/data/raw"));
        assert_eq!(settings.temp_dir, PathBuf::from("/srv/getl/data/temp"));
        assert_eq!(
            settings.warehouse_path,
            PathBuf::from("/srv/getl/data/warehouse.duckdb")
        );
        assert_eq!(
            settings.migrations_dir,
            PathBuf::from("/srv/getl/sql/migrations")
        );
        assert_eq!(
            settings.datasets_file,
            PathBuf::from("/srv/getl/config/datasets.yml")
        );
    }

    #[test]
    fn test_concurrency_defaults() {
        let settings = Settings::new(".");
        assert!(settings.max_concurrent_extracts >= 1);
        assert!(settings.max_concurrent_sql >= 2);
        assert_eq!(settings.extract_timeout, Duration::from_secs(300));
        assert_eq!(settings.max_log_files, Some(DEFAULT_MAX_LOG_FILES));
    }

    #[test]
    fn test_builder_overrides() {
        let settings = Settings::new("/p")
            .with_max_concurrent_extracts(3)
            .with_max_concurrent_sql(1)
            .with_config_dir("/etc/getl")
            .with_max_log_files(None);

        assert_eq!(settings.max_concurrent_extracts, 3);
        assert_eq!(settings.max_concurrent_sql, 1);
        assert_eq!(settings.max_log_files, None);
        assert_eq!(
            settings.datasets_file,
            PathBuf::from("/etc/getl/datasets.yml")
        );
    }

    #[test]
    fn test_per_dataset_paths() {
        let settings = Settings::new("/p");
        assert_eq!(
            settings.snapshot_path("roads"),
            PathBuf::from("/p/data/raw/roads.parquet")
        );
        assert_eq!(
            settings.temp_db_path("roads"),
            PathBuf::from("/p/data/temp/roads.duckdb")
        );
    }

    #[test]
    fn test_validate() {
        assert!(Settings::new(".").validate().is_ok());
        assert!(
            Settings::new(".")
                .with_max_concurrent_extracts(0)
                .validate()
                .is_err()
        );
        assert!(
            Settings::new(".")
                .with_extract_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::new(dir.path());
        settings.ensure_dirs().unwrap();
        assert!(settings.raw_dir.is_dir());
        assert!(settings.temp_dir.is_dir());
        assert!(settings.logs_dir.is_dir());
    }
}
