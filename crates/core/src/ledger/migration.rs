//! Migration files

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{LedgerError, LedgerResult};
use crate::templates::{MERGED_SUFFIX, Sections, TEMPLATE_SUFFIX};

static FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)_(.+)$").expect("valid filename regex"));

/// Application state of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Applied,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Applied => write!(f, "applied"),
        }
    }
}

/// How a migration file is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    /// Run once per database, un-templated
    Static,
    /// Rendered and applied once per dataset
    Template,
    /// Run in the warehouse after every merge
    Merged,
}

impl MigrationKind {
    /// Classify a migration by filename
    pub fn of(filename: &str) -> Self {
        if filename.ends_with(TEMPLATE_SUFFIX) {
            MigrationKind::Template
        } else if filename.ends_with(MERGED_SUFFIX) {
            MigrationKind::Merged
        } else {
            MigrationKind::Static
        }
    }
}

/// A discovered migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub path: PathBuf,
    pub up_sql: String,
    pub down_sql: String,
    pub status: MigrationStatus,
    pub kind: MigrationKind,
}

impl Migration {
    /// `{version}_{name}`
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }

    /// Whether a rollback script is available
    pub fn has_down(&self) -> bool {
        crate::templates::has_statements(&self.down_sql)
    }

    /// Whether the up section has anything to execute
    pub fn has_up(&self) -> bool {
        crate::templates::has_statements(&self.up_sql)
    }
}

/// Split a filename stem into `(version, name)`
///
/// `001_create_schemas` → `("001", "create_schemas")`; stems without a
/// numeric prefix use the stem for both.
pub fn parse_filename(stem: &str) -> (String, String) {
    match FILENAME.captures(stem) {
        Some(caps) => (caps[1].to_string(), caps[2].to_string()),
        None => (stem.to_string(), stem.to_string()),
    }
}

/// Discover `*.sql` files in a directory, sorted by filename
pub fn discover_migrations(dir: &Path, applied: &HashSet<String>) -> LedgerResult<Vec<Migration>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| LedgerError::io(dir, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    paths.sort();

    let mut migrations = Vec::with_capacity(paths.len());
    for path in paths {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = filename.trim_end_matches(".sql");
        let (version, name) = parse_filename(stem);
        let content = std::fs::read_to_string(&path).map_err(|e| LedgerError::io(&path, e))?;
        let sections = Sections::parse(&content);

        migrations.push(Migration {
            status: if applied.contains(&version) {
                MigrationStatus::Applied
            } else {
                MigrationStatus::Pending
            },
            kind: MigrationKind::of(&filename),
            version,
            name,
            path,
            up_sql: sections.up,
            down_sql: sections.down,
        });
    }
    Ok(migrations)
}

/// Compare two versions numerically when both are numbers
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// SHA-256 hex digest of SQL text
pub fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Ledger key of a template applied to one dataset
pub fn template_key(version: &str, dataset_id: &str) -> String {
    format!("{version}:{dataset_id}")
}

/// Filename-safe form of a migration name
///
/// Lowercases and collapses every run of non-word characters to `_`.
pub fn safe_name(name: &str) -> String {
    static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w]+").expect("valid regex"));
    NON_WORD
        .replace_all(&name.to_lowercase(), "_")
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_filename("001_create_schemas"),
            ("001".to_string(), "create_schemas".to_string())
        );
        assert_eq!(
            parse_filename("readme"),
            ("readme".to_string(), "readme".to_string())
        );
    }

    #[test]
    fn test_kind() {
        assert_eq!(MigrationKind::of("001_schemas.sql"), MigrationKind::Static);
        assert_eq!(
            MigrationKind::of("004_staging_x_template.sql"),
            MigrationKind::Template
        );
        assert_eq!(
            MigrationKind::of("010_h3_cells_merged.sql"),
            MigrationKind::Merged
        );
    }

    #[test]
    fn test_discover_sorted_with_status() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("002_tables.sql"),
            "-- migrate:up\nCREATE TABLE x (id INT);\n-- migrate:down\nDROP TABLE x;",
        )
        .unwrap();
        std::fs::write(dir.path().join("001_schemas.sql"), "CREATE SCHEMA raw;").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let applied: HashSet<String> = ["001".to_string()].into_iter().collect();
        let migrations = discover_migrations(dir.path(), &applied).unwrap();

        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].full_name(), "001_schemas");
        assert_eq!(migrations[0].status, MigrationStatus::Applied);
        assert_eq!(migrations[0].up_sql, "CREATE SCHEMA raw;");
        assert!(!migrations[0].has_down());
        assert_eq!(migrations[1].status, MigrationStatus::Pending);
        assert_eq!(migrations[1].down_sql, "DROP TABLE x;");
        assert!(migrations[1].has_down());
    }

    #[test]
    fn test_discover_missing_dir() {
        let migrations =
            discover_migrations(Path::new("/nonexistent/migrations"), &HashSet::new()).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_compare_versions() {
        use std::cmp::Ordering;
        assert_eq!(compare_versions("002", "010"), Ordering::Less);
        assert_eq!(compare_versions("10", "9"), Ordering::Greater);
        assert_eq!(compare_versions("004", "4"), Ordering::Equal);
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = checksum("SELECT 1;");
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum("SELECT 1;"));
        assert_ne!(a, checksum("SELECT 2;"));
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("Add H3 index!"), "add_h3_index");
        assert_eq!(safe_name("  users -- table "), "users_table");
    }

    #[test]
    fn test_template_key() {
        assert_eq!(template_key("004", "roads"), "004:roads");
        assert_eq!(
            template_key("aab_ext_restr/001", "roads"),
            "aab_ext_restr/001:roads"
        );
    }
}
