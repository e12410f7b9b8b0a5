//! Geometry column normalization

use tracing::debug;

use crate::db::{Database, DbResult, quote_ident};

/// Rename a known alternate geometry column to `canonical`
///
/// Matching is case-insensitive and the first alias found wins. A table that
/// already has the canonical column is left untouched, so the rename is
/// idempotent. Returns the column that was renamed, if any.
pub fn normalize_geometry_column(
    db: &Database,
    schema: &str,
    table: &str,
    canonical: &str,
    aliases: &[String],
) -> DbResult<Option<String>> {
    let columns = db.column_names(schema, table)?;
    if columns.iter().any(|c| c.eq_ignore_ascii_case(canonical)) {
        return Ok(None);
    }

    for alias in aliases {
        if let Some(actual) = columns.iter().find(|c| c.eq_ignore_ascii_case(alias)) {
            db.execute_batch(&format!(
                "ALTER TABLE {}.{} RENAME COLUMN {} TO {};",
                quote_ident(schema),
                quote_ident(table),
                quote_ident(actual),
                quote_ident(canonical)
            ))?;
            debug!(table, from = %actual, to = canonical, "Geometry column renamed");
            return Ok(Some(actual.clone()));
        }
    }
    Ok(None)
}
