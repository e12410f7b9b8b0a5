//! Typed dataset records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::settings::CANONICAL_GEOMETRY;

/// Sigil marking a field-mapping value as a column reference
pub const COLUMN_SIGIL: char = '$';

/// Number of free-form `data_N` columns a template can project
pub const EXTRA_DATA_SLOTS: usize = 5;

/// One dataset as declared in the definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Unique dataset id, also the snapshot file stem and raw table name
    pub id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the extractor that fetches this dataset
    #[serde(default)]
    pub plugin: String,
    /// Named sub-pipeline, injected when loaded from a `pipelines:` group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    /// Dataset category used for filtering runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Disabled datasets are skipped unless explicitly requested
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How source columns map onto the template variables
    #[serde(default)]
    pub field_mapping: FieldMapping,
    /// Connector-specific keys the engine does not interpret (url, layer, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_enabled() -> bool {
    true
}

impl DatasetConfig {
    /// Create a dataset with default field mapping
    pub fn new(id: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            plugin: plugin.into(),
            pipeline: None,
            typ: None,
            enabled: true,
            field_mapping: FieldMapping::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Set the pipeline
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    /// Set the field mapping
    pub fn with_field_mapping(mut self, mapping: FieldMapping) -> Self {
        self.field_mapping = mapping;
        self
    }

    /// Set a connector-specific parameter
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra
            .insert(key.into(), serde_yaml::Value::String(value.into()));
        self
    }

    /// Pipeline name, treating an empty string as no pipeline
    pub fn pipeline(&self) -> Option<&str> {
        self.pipeline.as_deref().filter(|p| !p.is_empty())
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Connector parameter as a string, if present and scalar
    pub fn extra_str(&self, key: &str) -> Option<String> {
        match self.extra.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Field mapping from source columns to template variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    /// Source id column, with or without the `$` sigil
    pub source_id_column: String,
    /// Geometry column name after normalization
    pub geometry_column: String,
    pub h3_center_resolution: u8,
    pub h3_polyfill_resolution: u8,
    pub h3_line_resolution: u8,
    pub h3_point_resolution: u8,
    pub h3_line_buffer_meters: u32,
    /// Class code, always a literal
    pub klass: String,
    /// Group, literal or `$column`
    pub grupp: String,
    /// Type, literal or `$column`
    pub typ: String,
    /// Supplier, always a literal
    pub leverantor: String,
    /// `data_1`..`data_5` to source column
    pub data_mappings: BTreeMap<String, String>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            source_id_column: String::new(),
            geometry_column: CANONICAL_GEOMETRY.to_string(),
            h3_center_resolution: 13,
            h3_polyfill_resolution: 11,
            h3_line_resolution: 12,
            h3_point_resolution: 13,
            h3_line_buffer_meters: 10,
            klass: String::new(),
            grupp: String::new(),
            typ: String::new(),
            leverantor: String::new(),
            data_mappings: BTreeMap::new(),
        }
    }
}

impl FieldMapping {
    /// Source id column name without the sigil
    pub fn source_id_column_name(&self) -> &str {
        column_name(&self.source_id_column)
    }

    /// SQL expression for the source id
    pub fn source_id_expr(&self) -> String {
        let col = self.source_id_column_name().trim();
        if col.is_empty() {
            "''".to_string()
        } else {
            format!("s.{col}::VARCHAR")
        }
    }

    /// SQL expression for the group field
    pub fn grupp_expr(&self) -> String {
        FieldValue::parse(&self.grupp).sql_expr()
    }

    /// SQL expression for the type field
    pub fn typ_expr(&self) -> String {
        FieldValue::parse(&self.typ).sql_expr()
    }

    /// SQL expression for extra data slot `slot` (1-based)
    ///
    /// Extra data values are always column references; the sigil is optional.
    pub fn data_expr(&self, slot: usize) -> String {
        match self.data_mappings.get(&format!("data_{slot}")) {
            Some(source) if !column_name(source).is_empty() => {
                FieldValue::Column(column_name(source).to_string()).sql_expr()
            }
            _ => FieldValue::Empty.sql_expr(),
        }
    }
}

/// A field-mapping value as interpreted by the template generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// No value configured
    Empty,
    /// Reference to a source column (`$column`)
    Column(String),
    /// Constant string
    Literal(String),
}

impl FieldValue {
    /// Parse a raw mapping value
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            FieldValue::Empty
        } else if let Some(col) = raw.strip_prefix(COLUMN_SIGIL) {
            FieldValue::Column(col.to_string())
        } else {
            FieldValue::Literal(raw.to_string())
        }
    }

    /// Render as a SQL expression over the source alias `s`
    pub fn sql_expr(&self) -> String {
        match self {
            FieldValue::Empty => "''".to_string(),
            FieldValue::Column(col) => format!("COALESCE(s.{col}::VARCHAR, '')"),
            FieldValue::Literal(lit) => format!("'{}'", lit.replace('\'', "''")),
        }
    }
}

/// Strip a leading column sigil
pub fn column_name(raw: &str) -> &str {
    raw.strip_prefix(COLUMN_SIGIL).unwrap_or(raw)
}
