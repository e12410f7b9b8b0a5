//! Name-keyed extractor registry

use std::collections::BTreeMap;
use std::sync::Arc;

use super::builtin::{FileExtractor, ParquetExtractor};
use super::error::ExtractError;
use super::extractor::Extractor;

/// Builds an extractor instance
pub type ExtractorFactory = Arc<dyn Fn() -> Arc<dyn Extractor> + Send + Sync>;

/// Maps plugin names to extractor factories
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    factories: BTreeMap<String, ExtractorFactory>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ExtractorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `parquet` and `file` extractors
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("parquet", || Arc::new(ParquetExtractor) as Arc<dyn Extractor>);
        registry.register("file", || Arc::new(FileExtractor) as Arc<dyn Extractor>);
        registry
    }

    /// Register a factory under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Extractor> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register one shared instance under `name`
    pub fn register_shared(&mut self, name: impl Into<String>, extractor: Arc<dyn Extractor>) {
        self.register(name, move || extractor.clone());
    }

    /// Instantiate the extractor registered under `name`
    pub fn get(&self, name: &str) -> Result<Arc<dyn Extractor>, ExtractError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ExtractError::UnknownPlugin {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
