//! Built-in extractors for file sources

use async_trait::async_trait;
use tracing::info;

use super::error::ExtractError;
use super::extractor::{ExtractContext, ExtractResult, Extractor, SharedDatabase, load_raw_table, with_db};
use crate::catalog::DatasetConfig;
use crate::db::quote_literal;

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn source_of(dataset: &DatasetConfig) -> Result<String, ExtractError> {
    dataset
        .extra_str("path")
        .or_else(|| dataset.extra_str("url"))
        .ok_or_else(|| ExtractError::MissingField {
            dataset: dataset.id.clone(),
            field: "path".to_string(),
        })
}

/// Reads (Geo)Parquet from a local path or URL with `read_parquet`
///
/// Remote files are read directly by DuckDB through `httpfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetExtractor;

#[async_trait]
impl Extractor for ParquetExtractor {
    fn name(&self) -> &str {
        "parquet"
    }

    async fn extract(
        &self,
        dataset: &DatasetConfig,
        ctx: &ExtractContext,
        db: SharedDatabase,
    ) -> Result<ExtractResult, ExtractError> {
        let source = source_of(dataset)?;
        ctx.log(format!("  {}: reading {source}", dataset.id));

        let id = dataset.id.clone();
        let select = format!("SELECT * FROM read_parquet({})", quote_literal(&source));
        let rows = with_db(&db, move |db| load_raw_table(db, &id, &select)).await?;

        info!(dataset = %dataset.id, rows, "Parquet source loaded");
        Ok(ExtractResult::ok(rows, format!("{rows} rows from {source}")))
    }
}

/// Reads any GDAL-supported file with `ST_Read`
///
/// Remote sources are downloaded once into the shared cache. An optional
/// `layer` selects a layer of multi-layer formats such as GeoPackage.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileExtractor;

#[async_trait]
impl Extractor for FileExtractor {
    fn name(&self) -> &str {
        "file"
    }

    async fn extract(
        &self,
        dataset: &DatasetConfig,
        ctx: &ExtractContext,
        db: SharedDatabase,
    ) -> Result<ExtractResult, ExtractError> {
        let source = source_of(dataset)?;
        let local = if is_remote(&source) {
            ctx.log(format!("  {}: downloading {source}", dataset.id));
            ctx.download(&dataset.id, &source).await?
        } else {
            std::path::PathBuf::from(&source)
        };
        if !local.exists() {
            return Err(ExtractError::Source(format!(
                "source file not found: {}",
                local.display()
            )));
        }

        let mut select = format!(
            "SELECT * FROM ST_Read({}",
            quote_literal(&local.to_string_lossy())
        );
        if let Some(layer) = dataset.extra_str("layer") {
            select.push_str(&format!(", layer = {}", quote_literal(&layer)));
        }
        select.push(')');

        let id = dataset.id.clone();
        let rows = with_db(&db, move |db| load_raw_table(db, &id, &select)).await?;

        info!(dataset = %dataset.id, rows, "File source loaded");
        Ok(ExtractResult::ok(rows, format!("{rows} rows from {source}")))
    }
}
