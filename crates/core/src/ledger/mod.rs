//! Migration ledger
//!
//! Every database (the warehouse and each ephemeral per-dataset database)
//! carries its own `_migrations` table. Static migrations are recorded under
//! their version; templates are recorded once per dataset under
//! `"{version}:{dataset_id}"` so one template can be applied or pending
//! independently for every dataset.
//!
//! # Example
//!
//! ```rust,ignore
//! use getl_core::db::Database;
//! use getl_core::ledger::Migrator;
//!
//! let db = Database::open("data/warehouse.duckdb".as_ref())?;
//! let migrator = Migrator::new(&db, "sql/migrations")?;
//! let result = migrator.migrate(None, None)?;
//! println!("{}", result.message);
//! ```

mod error;
mod migration;
mod schema;

pub use error::{LedgerError, LedgerResult};
pub use migration::{
    Migration, MigrationKind, MigrationStatus, checksum, compare_versions, discover_migrations,
    parse_filename, safe_name, template_key,
};
pub use schema::{LedgerSchema, MIGRATIONS_TABLE};

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::Database;
use crate::sink::{LogSink, log_line};
use crate::templates::{TemplateCatalog, pipeline_name_from_dir};

/// Outcome of a migrate or rollback call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub success: bool,
    /// Versions applied (or rolled back)
    pub applied: Vec<String>,
    /// `(version, error)` of the migration that stopped the batch
    pub failed: Vec<(String, String)>,
    pub message: String,
}

/// One row of `migrate status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    pub version: String,
    pub name: String,
    pub status: MigrationStatus,
    pub has_down: bool,
}

/// Per-dataset application count of a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStatusRow {
    pub version: String,
    pub name: String,
    pub datasets_applied: i64,
}

/// A stored ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub applied_at: Option<String>,
    pub checksum: Option<String>,
}

/// Applies and tracks migrations in one database
pub struct Migrator<'a> {
    db: &'a Database,
    migrations_dir: PathBuf,
}

impl<'a> Migrator<'a> {
    /// Create a migrator, creating the ledger table if needed
    pub fn new(db: &'a Database, migrations_dir: impl Into<PathBuf>) -> LedgerResult<Self> {
        let migrator = Self {
            db,
            migrations_dir: migrations_dir.into(),
        };
        migrator.ensure_table()?;
        Ok(migrator)
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Idempotently create the ledger table
    pub fn ensure_table(&self) -> LedgerResult<()> {
        self.db.execute_batch(LedgerSchema::create_table())?;
        Ok(())
    }

    /// All recorded versions, including per-dataset template keys
    pub fn applied_versions(&self) -> LedgerResult<HashSet<String>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT version FROM _migrations")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut versions = HashSet::new();
        for row in rows {
            versions.insert(row?);
        }
        Ok(versions)
    }

    /// Every stored ledger row ordered by version
    pub fn records(&self) -> LedgerResult<Vec<MigrationRecord>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT version, name, CAST(applied_at AS VARCHAR), checksum \
             FROM _migrations ORDER BY version",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get(0)?,
                name: row.get(1)?,
                applied_at: row.get(2)?,
                checksum: row.get(3)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Discover every migration file with its status
    pub fn discover(&self) -> LedgerResult<Vec<Migration>> {
        let applied = self.applied_versions()?;
        discover_migrations(&self.migrations_dir, &applied)
    }

    fn static_migrations(&self) -> LedgerResult<Vec<Migration>> {
        let mut migrations: Vec<Migration> = self
            .discover()?
            .into_iter()
            .filter(|m| m.kind == MigrationKind::Static)
            .collect();
        migrations.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(migrations)
    }

    /// Static migrations not yet applied, in version order
    pub fn pending(&self) -> LedgerResult<Vec<Migration>> {
        Ok(self
            .static_migrations()?
            .into_iter()
            .filter(|m| m.status == MigrationStatus::Pending)
            .collect())
    }

    /// Static migrations already applied, in version order
    pub fn applied(&self) -> LedgerResult<Vec<Migration>> {
        Ok(self
            .static_migrations()?
            .into_iter()
            .filter(|m| m.status == MigrationStatus::Applied)
            .collect())
    }

    /// Apply pending static migrations up to and including `target`
    ///
    /// Stops at the first failure; later migrations stay pending.
    pub fn migrate(
        &self,
        target: Option<&str>,
        sink: Option<&LogSink>,
    ) -> LedgerResult<MigrationResult> {
        let pending = self.pending()?;
        if pending.is_empty() {
            return Ok(MigrationResult {
                success: true,
                applied: Vec::new(),
                failed: Vec::new(),
                message: "No pending migrations".to_string(),
            });
        }

        let mut applied = Vec::new();
        let mut failed = Vec::new();

        for migration in pending {
            if let Some(target) = target {
                if compare_versions(&migration.version, target) == Ordering::Greater {
                    break;
                }
            }

            log_line(sink, format!("Applying {}...", migration.full_name()));
            match self.apply(&migration) {
                Ok(()) => {
                    info!(version = %migration.version, name = %migration.name, "Migration applied");
                    log_line(sink, format!("  ✓ {} done", migration.full_name()));
                    applied.push(migration.version);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(version = %migration.version, error = %message, "Migration failed");
                    log_line(sink, format!("  ✗ {}: {message}", migration.full_name()));
                    failed.push((migration.version, message));
                    break;
                }
            }
        }

        let mut message = format!("Applied {} migration(s)", applied.len());
        if !failed.is_empty() {
            message.push_str(&format!(", {} failed", failed.len()));
        }
        Ok(MigrationResult {
            success: failed.is_empty(),
            applied,
            failed,
            message,
        })
    }

    fn apply(&self, migration: &Migration) -> LedgerResult<()> {
        if migration.has_up() {
            self.db.execute_batch(&migration.up_sql)?;
        }
        self.db.conn().execute(
            "INSERT INTO _migrations (version, name, checksum) VALUES (?, ?, ?)",
            duckdb::params![
                migration.version,
                migration.name,
                checksum(&migration.up_sql)
            ],
        )?;
        Ok(())
    }

    /// Roll back the `steps` most recently applied static migrations
    ///
    /// Migrations without down SQL are skipped with a warning and still count
    /// as a step. Stops at the first failure.
    pub fn rollback(&self, steps: usize, sink: Option<&LogSink>) -> LedgerResult<MigrationResult> {
        let mut applied = self.applied()?;
        applied.reverse();

        if applied.is_empty() {
            return Ok(MigrationResult {
                success: true,
                applied: Vec::new(),
                failed: Vec::new(),
                message: "No migrations to roll back".to_string(),
            });
        }

        let mut rolled_back = Vec::new();
        let mut failed = Vec::new();

        for migration in applied.into_iter().take(steps) {
            if !migration.has_down() {
                warn!(version = %migration.version, "Migration has no down SQL, skipping");
                log_line(
                    sink,
                    format!("  ⚠ {} has no down SQL, skipping", migration.full_name()),
                );
                continue;
            }

            log_line(sink, format!("Rolling back {}...", migration.full_name()));
            let outcome = self.db.execute_batch(&migration.down_sql).and_then(|()| {
                self.db
                    .conn()
                    .execute(
                        "DELETE FROM _migrations WHERE version = ?",
                        [&migration.version],
                    )
                    .map(|_| ())
                    .map_err(Into::into)
            });

            match outcome {
                Ok(()) => {
                    info!(version = %migration.version, "Migration rolled back");
                    log_line(sink, format!("  ✓ {} reverted", migration.full_name()));
                    rolled_back.push(migration.version);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(version = %migration.version, error = %message, "Rollback failed");
                    log_line(sink, format!("  ✗ {}: {message}", migration.full_name()));
                    failed.push((migration.version, message));
                    break;
                }
            }
        }

        let mut message = format!("Rolled back {} migration(s)", rolled_back.len());
        if !failed.is_empty() {
            message.push_str(&format!(", {} failed", failed.len()));
        }
        Ok(MigrationResult {
            success: failed.is_empty(),
            applied: rolled_back,
            failed,
            message,
        })
    }

    /// Status of every static migration
    pub fn status(&self) -> LedgerResult<Vec<StatusRow>> {
        Ok(self
            .static_migrations()?
            .into_iter()
            .map(|m| StatusRow {
                has_down: m.has_down(),
                version: m.version,
                name: m.name,
                status: m.status,
            })
            .collect())
    }

    /// Templates with the number of datasets each was applied to
    ///
    /// Shared templates come first, then each pipeline directory's templates
    /// under their qualified version (`aab_ext_restr/001`).
    pub fn template_status(&self) -> LedgerResult<Vec<TemplateStatusRow>> {
        let catalog = TemplateCatalog::new(&self.migrations_dir);
        let mut templates = catalog.list_templates(None)?;
        for dir in catalog.list_pipeline_dirs()? {
            templates.extend(
                catalog
                    .list_templates(Some(pipeline_name_from_dir(&dir)))?
                    .into_iter()
                    .filter(|t| t.pipeline_dir.as_deref() == Some(dir.as_str())),
            );
        }

        let mut rows = Vec::with_capacity(templates.len());
        for template in templates {
            let version = template.version();
            let datasets_applied: i64 = self.db.conn().query_row(
                "SELECT COUNT(*) FROM _migrations WHERE starts_with(version, ?)",
                [format!("{version}:")],
                |row| row.get(0),
            )?;
            rows.push(TemplateStatusRow {
                name: template.migration_name(),
                version,
                datasets_applied,
            });
        }
        Ok(rows)
    }

    /// Write a new empty migration file with the next free version
    pub fn create(&self, name: &str, sink: Option<&LogSink>) -> LedgerResult<PathBuf> {
        let slug = safe_name(name);
        if slug.is_empty() {
            return Err(LedgerError::InvalidName(name.to_string()));
        }
        std::fs::create_dir_all(&self.migrations_dir)
            .map_err(|e| LedgerError::io(&self.migrations_dir, e))?;

        let next = std::fs::read_dir(&self.migrations_dir)
            .map_err(|e| LedgerError::io(&self.migrations_dir, e))?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".sql") {
                    return None;
                }
                let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u32>().ok()
            })
            .max()
            .map_or(1, |max| max + 1);

        let version = format!("{next:03}");
        let path = self.migrations_dir.join(format!("{version}_{slug}.sql"));
        let content = format!(
            "-- Migration: {name}\n-- Version: {version}\n-- Created: {}\n\n-- migrate:up\n-- Write your SQL here\n\n\n-- migrate:down\n-- Write rollback SQL here (optional)\n\n",
            Utc::now().to_rfc3339()
        );
        std::fs::write(&path, content).map_err(|e| LedgerError::io(&path, e))?;

        info!(path = %path.display(), "Created migration");
        log_line(sink, format!("Created {}", path.display()));
        Ok(path)
    }

    /// Bring a fresh database to the same baseline as the warehouse
    pub fn run_init_migrations(&self) -> LedgerResult<MigrationResult> {
        self.migrate(None, None)
    }

    /// Whether a template was already applied to a dataset
    pub fn is_template_applied(&self, version: &str, dataset_id: &str) -> LedgerResult<bool> {
        let count: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM _migrations WHERE version = ?",
            [template_key(version, dataset_id)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a template as applied to a dataset
    ///
    /// Returns `false` if the dataset already had a row for this template.
    pub fn record_template(
        &self,
        version: &str,
        name: &str,
        dataset_id: &str,
        rendered_sql: &str,
    ) -> LedgerResult<bool> {
        let inserted = self.db.conn().execute(
            "INSERT INTO _migrations (version, name, checksum) VALUES (?, ?, ?)",
            duckdb::params![
                template_key(version, dataset_id),
                template_key(name, dataset_id),
                checksum(rendered_sql)
            ],
        );
        match inserted {
            Ok(_) => Ok(true),
            Err(e) => {
                if self.is_template_applied(version, dataset_id)? {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Mark a template as pending again for a dataset
    pub fn forget_template(&self, version: &str, dataset_id: &str) -> LedgerResult<bool> {
        let deleted = self.db.conn().execute(
            "DELETE FROM _migrations WHERE version = ?",
            [template_key(version, dataset_id)],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::collecting_sink;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn symmetric_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "001_create_schemas.sql",
            "-- migrate:up\nCREATE SCHEMA raw; CREATE SCHEMA mart;\n-- migrate:down\nDROP SCHEMA mart; DROP SCHEMA raw;\n",
        );
        write(
            dir.path(),
            "002_create_tables.sql",
            "-- migrate:up\nCREATE TABLE mart.cells (h3 VARCHAR);\n-- migrate:down\nDROP TABLE mart.cells;\n",
        );
        write(
            dir.path(),
            "003_seed.sql",
            "-- migrate:up\nINSERT INTO mart.cells VALUES ('8a');\n-- migrate:down\nDELETE FROM mart.cells;\n",
        );
        write(
            dir.path(),
            "004_staging_transform_template.sql",
            "CREATE TABLE {{ schema }}.{{ dataset_id }} AS SELECT 1;",
        );
        dir
    }

    #[test]
    fn test_ensure_table_idempotent() {
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, "/nonexistent").unwrap();
        migrator.ensure_table().unwrap();
        assert!(db.table_exists("main", MIGRATIONS_TABLE).unwrap());
    }

    #[test]
    fn test_migrate_applies_static_in_order() {
        let dir = symmetric_dir();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();

        let result = migrator.migrate(None, None).unwrap();
        assert!(result.success);
        assert_eq!(result.applied, vec!["001", "002", "003"]);
        assert_eq!(db.row_count("mart", "cells").unwrap(), 1);

        let records = migrator.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].checksum.as_ref().map(String::len), Some(64));

        let again = migrator.migrate(None, None).unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.message, "No pending migrations");
    }

    #[test]
    fn test_migrate_to_target() {
        let dir = symmetric_dir();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();

        let result = migrator.migrate(Some("002"), None).unwrap();
        assert_eq!(result.applied, vec!["001", "002"]);
        assert_eq!(migrator.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_migrate_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "001_ok.sql", "CREATE TABLE a (id INT);");
        write(dir.path(), "002_broken.sql", "CREATE TABLE nope.b (id INT);");
        write(dir.path(), "003_later.sql", "CREATE TABLE c (id INT);");

        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();
        let (sink, lines) = collecting_sink();

        let result = migrator.migrate(None, Some(&sink)).unwrap();
        assert!(!result.success);
        assert_eq!(result.applied, vec!["001"]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, "002");
        assert!(result.message.contains("1 failed"));

        let pending: Vec<String> = migrator
            .pending()
            .unwrap()
            .into_iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(pending, vec!["002", "003"]);
        assert!(lines.lock().unwrap().iter().any(|l| l.contains("✗ 002_broken")));
    }

    #[test]
    fn test_migrate_rollback_migrate_round_trip() {
        let dir = symmetric_dir();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();

        migrator.migrate(None, None).unwrap();
        let before = migrator.applied_versions().unwrap();

        let rolled = migrator.rollback(2, None).unwrap();
        assert!(rolled.success);
        assert_eq!(rolled.applied, vec!["003", "002"]);
        assert!(!db.table_exists("mart", "cells").unwrap());

        migrator.migrate(None, None).unwrap();
        assert_eq!(migrator.applied_versions().unwrap(), before);
        assert_eq!(db.row_count("mart", "cells").unwrap(), 1);
    }

    #[test]
    fn test_rollback_skips_missing_down() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "001_a.sql",
            "-- migrate:up\nCREATE TABLE a (id INT);\n-- migrate:down\nDROP TABLE a;",
        );
        write(dir.path(), "002_b.sql", "CREATE TABLE b (id INT);");

        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();
        migrator.migrate(None, None).unwrap();

        let (sink, lines) = collecting_sink();
        let result = migrator.rollback(1, Some(&sink)).unwrap();
        assert!(result.success, "missing down SQL is a warning");
        assert!(result.applied.is_empty());
        assert!(lines.lock().unwrap()[0].contains("no down SQL"));

        let result = migrator.rollback(2, None).unwrap();
        assert_eq!(result.applied, vec!["001"]);
    }

    #[test]
    fn test_rollback_nothing_applied() {
        let dir = symmetric_dir();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();
        let result = migrator.rollback(1, None).unwrap();
        assert!(result.success);
        assert_eq!(result.message, "No migrations to roll back");
    }

    #[test]
    fn test_status_excludes_templates() {
        let dir = symmetric_dir();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();
        migrator.migrate(Some("001"), None).unwrap();

        let status = migrator.status().unwrap();
        assert_eq!(status.len(), 3);
        assert_eq!(status[0].status, MigrationStatus::Applied);
        assert_eq!(status[1].status, MigrationStatus::Pending);
        assert!(status.iter().all(|s| s.has_down));
    }

    #[test]
    fn test_template_tracking() {
        let dir = symmetric_dir();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();

        assert!(!migrator.is_template_applied("004", "roads").unwrap());
        assert!(
            migrator
                .record_template("004", "staging_transform_template", "roads", "SELECT 1")
                .unwrap()
        );
        assert!(migrator.is_template_applied("004", "roads").unwrap());
        assert!(!migrator.is_template_applied("004", "rivers").unwrap());

        // Duplicate insert is treated as already applied
        assert!(
            !migrator
                .record_template("004", "staging_transform_template", "roads", "SELECT 1")
                .unwrap()
        );

        migrator
            .record_template("004", "staging_transform_template", "rivers", "SELECT 2")
            .unwrap();
        let status = migrator.template_status().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].datasets_applied, 2);

        assert!(migrator.forget_template("004", "roads").unwrap());
        assert!(!migrator.is_template_applied("004", "roads").unwrap());

        // Template rows never make static migrations look applied
        assert!(migrator.applied().unwrap().is_empty());
    }

    #[test]
    fn test_template_status_includes_pipeline_templates() {
        let dir = symmetric_dir();
        let scoped = dir.path().join("aab_ext_restr");
        std::fs::create_dir_all(&scoped).unwrap();
        std::fs::write(scoped.join("001_staging_template.sql"), "SELECT 1;").unwrap();
        std::fs::write(scoped.join("002_mart_template.sql"), "SELECT 2;").unwrap();
        std::fs::create_dir_all(dir.path().join("_drafts")).unwrap();
        std::fs::write(dir.path().join("_drafts/001_x_template.sql"), "SELECT 3;").unwrap();

        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();
        migrator
            .record_template("aab_ext_restr/001", "staging_template", "naturreservat", "SELECT 1")
            .unwrap();

        let status = migrator.template_status().unwrap();
        let versions: Vec<&str> = status.iter().map(|s| s.version.as_str()).collect();
        assert_eq!(versions, vec!["004", "aab_ext_restr/001", "aab_ext_restr/002"]);
        assert_eq!(status[1].name, "staging_template");
        assert_eq!(status[1].datasets_applied, 1);
        assert_eq!(status[2].datasets_applied, 0);
    }

    #[test]
    fn test_create_next_version() {
        let dir = symmetric_dir();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();

        let path = migrator.create("Add H3 index!", None).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "005_add_h3_index.sql"
        );
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("-- migrate:up"));
        assert!(content.contains("-- migrate:down"));

        let created = migrator
            .status()
            .unwrap()
            .into_iter()
            .find(|s| s.version == "005")
            .unwrap();
        assert!(!created.has_down, "placeholder comments are not SQL");
    }

    #[test]
    fn test_create_in_empty_dir() {
        let dir = TempDir::new().unwrap();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path().join("new")).unwrap();
        let path = migrator.create("first", None).unwrap();
        assert!(path.ends_with("001_first.sql"));

        assert!(matches!(
            migrator.create("!!!", None),
            Err(LedgerError::InvalidName(_))
        ));
    }

    #[test]
    fn test_created_migration_applies_as_noop() {
        let dir = TempDir::new().unwrap();
        let db = Database::memory().unwrap();
        let migrator = Migrator::new(&db, dir.path()).unwrap();
        migrator.create("placeholder", None).unwrap();

        let result = migrator.run_init_migrations().unwrap();
        assert!(result.success);
        assert_eq!(result.applied, vec!["001"]);
    }
}
