//! Dataset catalog
//!
//! Loads the declarative dataset definition and normalizes it to a flat list
//! of [`DatasetConfig`] records. Two document shapes are accepted:
//!
//! ```yaml
//! datasets:
//!   - id: naturreservat
//!     plugin: wfs
//! ```
//!
//! ```yaml
//! pipelines:
//!   - id: ext_restr
//!     name: Extended restrictions
//!     datasets:
//!       - id: naturreservat
//!         plugin: wfs
//! ```
//!
//! In the grouped form every dataset gets `pipeline` set to its group id.

mod dataset;
mod error;

pub use dataset::{
    COLUMN_SIGIL, DatasetConfig, EXTRA_DATA_SLOTS, FieldMapping, FieldValue, column_name,
};
pub use error::{CatalogError, CatalogResult};

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    pipelines: Option<Vec<PipelineGroup>>,
    #[serde(default)]
    datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Deserialize)]
struct PipelineGroup {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    datasets: Vec<DatasetConfig>,
}

/// Metadata about one pipeline group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub dataset_count: usize,
    pub enabled_count: usize,
}

/// Selection applied to the catalog before a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetFilter {
    /// Only these ids (empty = all)
    pub ids: Vec<String>,
    /// Only datasets of this type
    pub typ: Option<String>,
    /// Keep datasets with `enabled: false`
    pub include_disabled: bool,
}

impl DatasetFilter {
    /// Filter that selects every enabled dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given ids
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = ids;
        self
    }

    /// Restrict to a dataset type
    pub fn with_typ(mut self, typ: impl Into<String>) -> Self {
        self.typ = Some(typ.into());
        self
    }

    /// Check if a dataset is selected
    pub fn matches(&self, dataset: &DatasetConfig) -> bool {
        if let Some(typ) = &self.typ {
            if dataset.typ.as_ref() != Some(typ) {
                return false;
            }
        }
        if !self.ids.is_empty() && !self.ids.contains(&dataset.id) {
            return false;
        }
        self.include_disabled || dataset.enabled
    }
}

/// The flat list of datasets for one run
#[derive(Debug, Clone, Default)]
pub struct DatasetCatalog {
    datasets: Vec<DatasetConfig>,
    pipelines: Vec<PipelineSummary>,
}

impl DatasetCatalog {
    /// Load the catalog from a YAML file; a missing file yields an empty catalog
    pub fn load(path: &Path) -> CatalogResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Dataset definition not found, using empty catalog");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            CatalogError::Parse { source, .. } => CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse a catalog from YAML text
    pub fn from_yaml(content: &str) -> CatalogResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: DefinitionFile =
            serde_yaml::from_str(content).map_err(|source| CatalogError::Parse {
                path: Default::default(),
                source,
            })?;

        let (datasets, pipelines) = match file.pipelines {
            Some(groups) => flatten_pipelines(groups),
            None => (file.datasets, Vec::new()),
        };
        Self::from_datasets(datasets).map(|mut catalog| {
            catalog.pipelines = pipelines;
            catalog
        })
    }

    /// Build a catalog from already-typed datasets
    pub fn from_datasets(datasets: Vec<DatasetConfig>) -> CatalogResult<Self> {
        let mut seen = HashSet::new();
        for ds in &datasets {
            if !seen.insert(ds.id.as_str()) {
                return Err(CatalogError::DuplicateId(ds.id.clone()));
            }
        }
        Ok(Self {
            datasets,
            pipelines: Vec::new(),
        })
    }

    /// All datasets in definition order
    pub fn datasets(&self) -> &[DatasetConfig] {
        &self.datasets
    }

    /// Pipeline group metadata (empty for the flat format)
    pub fn pipelines(&self) -> &[PipelineSummary] {
        &self.pipelines
    }

    /// Look up a dataset by id
    pub fn get(&self, id: &str) -> CatalogResult<&DatasetConfig> {
        self.datasets
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// Datasets selected by a filter, in definition order
    pub fn select(&self, filter: &DatasetFilter) -> Vec<DatasetConfig> {
        self.datasets
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    /// Distinct dataset types with their counts, sorted by type
    pub fn types(&self) -> Vec<(String, usize)> {
        let mut counts = std::collections::BTreeMap::new();
        for typ in self.datasets.iter().filter_map(|d| d.typ.as_ref()) {
            *counts.entry(typ.clone()).or_insert(0usize) += 1;
        }
        counts.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

fn flatten_pipelines(groups: Vec<PipelineGroup>) -> (Vec<DatasetConfig>, Vec<PipelineSummary>) {
    let mut datasets = Vec::new();
    let mut summaries = Vec::with_capacity(groups.len());

    for group in groups {
        summaries.push(PipelineSummary {
            name: group.name.clone().unwrap_or_else(|| group.id.clone()),
            description: group.description.clone(),
            dataset_count: group.datasets.len(),
            enabled_count: group.datasets.iter().filter(|d| d.enabled).count(),
            id: group.id.clone(),
        });
        for mut ds in group.datasets {
            ds.pipeline = Some(group.id.clone());
            datasets.push(ds);
        }
    }
    (datasets, summaries)
}

/// Load the flat dataset list from a definition file
pub fn load_datasets(path: &Path) -> CatalogResult<Vec<DatasetConfig>> {
    Ok(DatasetCatalog::load(path)?.datasets)
}

/// Load pipeline group metadata from a definition file
pub fn load_pipelines(path: &Path) -> CatalogResult<Vec<PipelineSummary>> {
    Ok(DatasetCatalog::load(path)?.pipelines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GROUPED: &str = r#"
pipelines:
  - id: ext_restr
    name: Extended restrictions
    datasets:
      - id: naturreservat
        plugin: wfs
        typ: skydd
        field_mapping:
          source_id_column: $objektid
          grupp: $skyddstyp
          klass: naturvard
      - id: biotopskydd
        plugin: wfs
        enabled: false
  - id: avdelning
    datasets:
      - id: avdelningar
        plugin: geoparquet
        typ: skog
"#;

    #[test]
    fn test_grouped_format_injects_pipeline() {
        let catalog = DatasetCatalog::from_yaml(GROUPED).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(
            catalog.get("naturreservat").unwrap().pipeline(),
            Some("ext_restr")
        );
        assert_eq!(
            catalog.get("avdelningar").unwrap().pipeline(),
            Some("avdelning")
        );

        let ds = catalog.get("naturreservat").unwrap();
        assert_eq!(ds.field_mapping.source_id_column_name(), "objektid");
        assert_eq!(ds.field_mapping.klass, "naturvard");
    }

    #[test]
    fn test_pipeline_summaries() {
        let catalog = DatasetCatalog::from_yaml(GROUPED).unwrap();
        let pipelines = catalog.pipelines();
        assert_eq!(pipelines.len(), 2);
        assert_eq!(pipelines[0].id, "ext_restr");
        assert_eq!(pipelines[0].name, "Extended restrictions");
        assert_eq!(pipelines[0].dataset_count, 2);
        assert_eq!(pipelines[0].enabled_count, 1);
        assert_eq!(pipelines[1].name, "avdelning");
    }

    #[test]
    fn test_flat_format() {
        let yaml = r#"
datasets:
  - id: a
    plugin: parquet
    pipeline: ext_restr
  - id: b
    plugin: parquet
"#;
        let catalog = DatasetCatalog::from_yaml(yaml).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("a").unwrap().pipeline(), Some("ext_restr"));
        assert_eq!(catalog.get("b").unwrap().pipeline(), None);
        assert!(catalog.pipelines().is_empty());
    }

    #[test]
    fn test_filter() {
        let catalog = DatasetCatalog::from_yaml(GROUPED).unwrap();

        let all = catalog.select(&DatasetFilter::new());
        assert_eq!(all.len(), 2, "disabled dataset is skipped");

        let skog = catalog.select(&DatasetFilter::new().with_typ("skog"));
        assert_eq!(skog.len(), 1);
        assert_eq!(skog[0].id, "avdelningar");

        let by_id = catalog.select(&DatasetFilter::new().with_ids(vec!["naturreservat".into()]));
        assert_eq!(by_id.len(), 1);

        let mut with_disabled = DatasetFilter::new();
        with_disabled.include_disabled = true;
        assert_eq!(catalog.select(&with_disabled).len(), 3);
    }

    #[test]
    fn test_types() {
        let catalog = DatasetCatalog::from_yaml(GROUPED).unwrap();
        assert_eq!(
            catalog.types(),
            vec![("skog".to_string(), 1), ("skydd".to_string(), 1)]
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let yaml = "datasets:\n  - id: a\n  - id: a\n";
        let err = DatasetCatalog::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn test_missing_and_empty_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("datasets.yml");
        assert!(load_datasets(&missing).unwrap().is_empty());

        std::fs::write(&missing, "").unwrap();
        assert!(load_datasets(&missing).unwrap().is_empty());
        assert!(load_pipelines(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_parse_error_carries_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("datasets.yml");
        std::fs::write(&path, "datasets: [ {id: }").unwrap();
        let err = DatasetCatalog::load(&path).unwrap_err();
        assert!(err.to_string().contains("datasets.yml"));
        assert!(err.user_message().contains("Hint:"));
    }

    #[test]
    fn test_not_found() {
        let catalog = DatasetCatalog::from_yaml(GROUPED).unwrap();
        assert!(matches!(
            catalog.get("missing"),
            Err(CatalogError::NotFound(_))
        ));
    }
}
