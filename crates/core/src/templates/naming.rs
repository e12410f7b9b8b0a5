//! Schema naming and chaining
//!
//! Every template writes into one schema and reads from the schema the
//! previous step wrote. Shared staging templates chain `raw → staging_004 →
//! staging_005 …`; a pipeline's first staging template reads the last shared
//! staging schema (the boundary) and later ones chain within
//! `staging_{pipeline}_NNN`. Mart templates always write `mart`.

use super::catalog::{TemplateInfo, template_number};

/// Schema holding loaded snapshots
pub const RAW_SCHEMA: &str = "raw";
/// Final schema every pipeline writes into
pub const MART_SCHEMA: &str = "mart";

fn is_staging(filename: &str) -> bool {
    filename.to_lowercase().contains("_staging_")
}

fn is_mart(filename: &str) -> bool {
    filename.to_lowercase().contains("_mart_")
}

/// Target schema of a template
///
/// `pipeline` is the pipeline the template is scoped to (None for shared
/// templates).
pub fn schema_name(filename: &str, pipeline: Option<&str>) -> String {
    let number = template_number(filename);
    if is_staging(filename) {
        match (pipeline, number) {
            (Some(p), Some(n)) => format!("staging_{p}_{n:03}"),
            (Some(p), None) => format!("staging_{p}"),
            (None, Some(n)) => format!("staging_{n:03}"),
            (None, None) => "staging".to_string(),
        }
    } else if is_mart(filename) {
        MART_SCHEMA.to_string()
    } else {
        "staging".to_string()
    }
}

/// `CREATE SCHEMA` statement for a template's target schema
pub fn schema_create_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {schema};")
}

/// The staging templates a pipeline's chain is computed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChain {
    boundary: String,
    shared_staging: Vec<u32>,
    pipeline_staging: Vec<u32>,
}

impl SchemaChain {
    /// Build a chain from an ordered template list
    ///
    /// The boundary is the schema of the highest-numbered shared staging
    /// template, or `fallback_boundary` when there is none.
    pub fn from_templates(templates: &[TemplateInfo], fallback_boundary: &str) -> Self {
        let staging_numbers = |shared: bool| -> Vec<u32> {
            templates
                .iter()
                .filter(|t| t.is_shared() == shared && is_staging(&t.filename))
                .filter_map(|t| t.number)
                .collect()
        };
        let shared_staging = staging_numbers(true);
        let pipeline_staging = staging_numbers(false);

        let boundary = shared_staging
            .iter()
            .max()
            .map(|n| format!("staging_{n:03}"))
            .unwrap_or_else(|| fallback_boundary.to_string());

        Self {
            boundary,
            shared_staging,
            pipeline_staging,
        }
    }

    /// Last shared staging schema, where pipelines take over
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Source schema of a template
    ///
    /// `pipeline` is the pipeline the template is scoped to (None for shared
    /// templates).
    pub fn prev_schema(&self, filename: &str, pipeline: Option<&str>) -> String {
        let Some(n) = template_number(filename) else {
            return RAW_SCHEMA.to_string();
        };

        match pipeline {
            Some(p) if is_staging(filename) => {
                if n <= 1 {
                    self.boundary.clone()
                } else {
                    format!("staging_{p}_{:03}", n - 1)
                }
            }
            Some(p) if is_mart(filename) => self
                .pipeline_staging
                .iter()
                .max()
                .map(|last| format!("staging_{p}_{last:03}"))
                .unwrap_or_else(|| self.boundary.clone()),
            Some(_) => self.boundary.clone(),
            None if is_staging(filename) => self
                .shared_staging
                .iter()
                .filter(|&&m| m < n)
                .max()
                .map(|m| format!("staging_{m:03}"))
                .unwrap_or_else(|| RAW_SCHEMA.to_string()),
            None if is_mart(filename) => self.boundary.clone(),
            None => RAW_SCHEMA.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(rel: &str) -> TemplateInfo {
        TemplateInfo::from_relative_path(rel).unwrap()
    }

    fn ext_restr_chain() -> SchemaChain {
        SchemaChain::from_templates(
            &[
                info("004_staging_transform_template.sql"),
                info("aab_ext_restr/001_staging_normalisering_template.sql"),
                info("aab_ext_restr/002_staging_klass_template.sql"),
                info("aab_ext_restr/003_mart_export_template.sql"),
            ],
            "staging_004",
        )
    }

    #[test]
    fn test_schema_names() {
        assert_eq!(schema_name("004_staging_x_template.sql", None), "staging_004");
        assert_eq!(
            schema_name("001_staging_x_template.sql", Some("ext_restr")),
            "staging_ext_restr_001"
        );
        assert_eq!(schema_name("009_mart_h3_template.sql", Some("ext_restr")), "mart");
        assert_eq!(schema_name("009_mart_h3_template.sql", None), "mart");
        assert_eq!(schema_name("staging_template.sql", None), "staging");
        assert_eq!(schema_name("staging_template.sql", Some("p")), "staging");
        assert_eq!(schema_name("x_staging_template.sql", Some("p")), "staging_p");
        assert_eq!(schema_name("003_macros_template.sql", None), "staging");
    }

    #[test]
    fn test_pipeline_handoff_from_shared_phase() {
        let chain = ext_restr_chain();
        assert_eq!(
            chain.prev_schema("001_staging_template.sql", Some("ext_restr")),
            "staging_004"
        );
        assert_eq!(
            chain.prev_schema("002_staging_template.sql", Some("ext_restr")),
            "staging_ext_restr_001"
        );
    }

    #[test]
    fn test_mart_reads_last_pipeline_staging() {
        let chain = ext_restr_chain();
        assert_eq!(
            chain.prev_schema("003_mart_export_template.sql", Some("ext_restr")),
            "staging_ext_restr_002"
        );
    }

    #[test]
    fn test_mart_without_pipeline_staging() {
        let chain = SchemaChain::from_templates(
            &[
                info("004_staging_transform_template.sql"),
                info("aaa_avdelning/001_mart_template.sql"),
            ],
            "staging_004",
        );
        assert_eq!(
            chain.prev_schema("001_mart_template.sql", Some("avdelning")),
            "staging_004"
        );
    }

    #[test]
    fn test_shared_chain() {
        let chain = SchemaChain::from_templates(
            &[
                info("004_staging_transform_template.sql"),
                info("005_staging_h3_template.sql"),
                info("009_mart_h3_template.sql"),
            ],
            "staging_004",
        );
        assert_eq!(chain.boundary(), "staging_005");
        assert_eq!(chain.prev_schema("004_staging_transform_template.sql", None), "raw");
        assert_eq!(chain.prev_schema("005_staging_h3_template.sql", None), "staging_004");
        assert_eq!(chain.prev_schema("009_mart_h3_template.sql", None), "staging_005");
        assert_eq!(chain.prev_schema("003_macros_template.sql", None), "raw");
        assert_eq!(chain.prev_schema("macros_template.sql", Some("p")), "raw");
    }

    #[test]
    fn test_fallback_boundary() {
        let chain = SchemaChain::from_templates(&[], "staging_004");
        assert_eq!(chain.boundary(), "staging_004");
        assert_eq!(
            chain.prev_schema("001_staging_template.sql", Some("ext_restr")),
            "staging_004"
        );
        assert_eq!(
            chain.prev_schema("007_other_template.sql", Some("ext_restr")),
            "staging_004"
        );
    }

    #[test]
    fn test_schema_create_sql() {
        assert_eq!(
            schema_create_sql("staging_ext_restr_001"),
            "CREATE SCHEMA IF NOT EXISTS staging_ext_restr_001;"
        );
    }
}
