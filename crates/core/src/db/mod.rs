//! Embedded database handle
//!
//! Thin wrapper over a DuckDB connection used for the warehouse, every
//! ephemeral per-dataset database and throwaway extraction databases.

mod error;

pub use error::{DbError, DbResult};

use std::path::{Path, PathBuf};

use tracing::debug;

/// An open DuckDB database
pub struct Database {
    conn: duckdb::Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open or create a database file, creating its parent directory
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = duckdb::Connection::open(path).map_err(|e| DbError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database
    pub fn memory() -> DbResult<Self> {
        let conn = duckdb::Connection::open_in_memory()?;
        Ok(Self { conn, path: None })
    }

    /// Get the database path (if not in-memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Underlying connection
    pub fn conn(&self) -> &duckdb::Connection {
        &self.conn
    }

    /// Execute one or more `;`-separated statements
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Install and load extensions, ignoring any that are unavailable
    ///
    /// Returns the extensions that loaded.
    pub fn load_extensions(&self, extensions: &[String]) -> Vec<String> {
        let mut loaded = Vec::new();
        for ext in extensions {
            match self
                .conn
                .execute_batch(&format!("INSTALL {ext}; LOAD {ext};"))
            {
                Ok(()) => loaded.push(ext.clone()),
                Err(e) => debug!(extension = %ext, error = %e, "Extension unavailable"),
            }
        }
        loaded
    }

    /// Create schemas if missing
    pub fn create_schemas<S: AsRef<str>>(&self, schemas: &[S]) -> DbResult<()> {
        for schema in schemas {
            self.conn.execute_batch(&format!(
                "CREATE SCHEMA IF NOT EXISTS {};",
                quote_ident(schema.as_ref())
            ))?;
        }
        Ok(())
    }

    /// Schemas of the main database, sorted
    pub fn schema_names(&self) -> DbResult<Vec<String>> {
        self.strings(
            "SELECT DISTINCT schema_name FROM duckdb_schemas() \
             WHERE database_name = current_database() AND NOT internal \
             ORDER BY schema_name",
            &[],
        )
    }

    /// Base tables in a schema of the main database, sorted
    pub fn table_names(&self, schema: &str) -> DbResult<Vec<String>> {
        self.strings(
            "SELECT table_name FROM duckdb_tables() \
             WHERE database_name = current_database() AND schema_name = ? \
             ORDER BY table_name",
            &[schema],
        )
    }

    /// Base tables in a schema of an attached database, sorted
    pub fn attached_table_names(&self, alias: &str, schema: &str) -> DbResult<Vec<String>> {
        self.strings(
            "SELECT table_name FROM duckdb_tables() \
             WHERE database_name = ? AND schema_name = ? \
             ORDER BY table_name",
            &[alias, schema],
        )
    }

    /// Schemas of an attached database, sorted
    pub fn attached_schema_names(&self, alias: &str) -> DbResult<Vec<String>> {
        self.strings(
            "SELECT DISTINCT schema_name FROM duckdb_schemas() \
             WHERE database_name = ? AND NOT internal \
             ORDER BY schema_name",
            &[alias],
        )
    }

    /// Column names of a table in declaration order
    pub fn column_names(&self, schema: &str, table: &str) -> DbResult<Vec<String>> {
        self.strings(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_catalog = current_database() AND table_schema = ? AND table_name = ? \
             ORDER BY ordinal_position",
            &[schema, table],
        )
    }

    /// Check if a table exists
    pub fn table_exists(&self, schema: &str, table: &str) -> DbResult<bool> {
        Ok(self.table_names(schema)?.iter().any(|t| t == table))
    }

    /// Number of rows in a table
    pub fn row_count(&self, schema: &str, table: &str) -> DbResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_ident(schema),
            quote_ident(table)
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// Attach another database file read-only under `alias`
    pub fn attach_read_only(&self, path: &Path, alias: &str) -> DbResult<()> {
        self.conn.execute_batch(&format!(
            "ATTACH {} AS {} (READ_ONLY);",
            quote_literal(&path.to_string_lossy()),
            quote_ident(alias)
        ))?;
        Ok(())
    }

    /// Detach a previously attached database
    pub fn detach(&self, alias: &str) -> DbResult<()> {
        self.conn
            .execute_batch(&format!("DETACH {};", quote_ident(alias)))?;
        Ok(())
    }

    /// Execute a query and return results as JSON
    pub fn query(&self, sql: &str) -> DbResult<Vec<serde_json::Value>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;

        let column_count = rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let column_names: Vec<String> = (0..column_count)
            .map(|i| {
                rows.as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let value: duckdb::types::Value = row.get(i)?;
                obj.insert(name.clone(), to_json(value));
            }
            results.push(serde_json::Value::Object(obj));
        }
        Ok(results)
    }

    fn strings(&self, sql: &str, params: &[&str]) -> DbResult<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(duckdb::params_from_iter(params.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn to_json(value: duckdb::types::Value) -> serde_json::Value {
    use duckdb::types::Value;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::TinyInt(n) => serde_json::Value::Number(n.into()),
        Value::SmallInt(n) => serde_json::Value::Number(n.into()),
        Value::Int(n) => serde_json::Value::Number(n.into()),
        Value::BigInt(n) => serde_json::Value::Number(n.into()),
        Value::UTinyInt(n) => serde_json::Value::Number(n.into()),
        Value::USmallInt(n) => serde_json::Value::Number(n.into()),
        Value::UInt(n) => serde_json::Value::Number(n.into()),
        Value::UBigInt(n) => serde_json::Value::Number(n.into()),
        Value::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Double(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s),
        other => serde_json::Value::String(format!("{:?}", other)),
    }
}

/// Quote an identifier for DuckDB
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for DuckDB
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
