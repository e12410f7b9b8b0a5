//! Ledger table DDL

/// Name of the ledger table present in every database
pub const MIGRATIONS_TABLE: &str = "_migrations";

/// Ledger DDL
pub struct LedgerSchema;

impl LedgerSchema {
    /// Idempotent DDL for the ledger table
    pub fn create_table() -> &'static str {
        r#"
CREATE TABLE IF NOT EXISTS _migrations (
    version VARCHAR PRIMARY KEY,
    name VARCHAR NOT NULL,
    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    checksum VARCHAR
);
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_shape() {
        let ddl = LedgerSchema::create_table();
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS _migrations"));
        assert!(ddl.contains("version VARCHAR PRIMARY KEY"));
        assert!(ddl.contains("checksum VARCHAR"));
        assert!(ddl.contains(MIGRATIONS_TABLE));
    }
}
