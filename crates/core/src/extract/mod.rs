//! Extraction
//!
//! Source connectors implement [`Extractor`] and are looked up by plugin
//! name in an [`ExtractorRegistry`]. The [`ExtractScheduler`] runs them in
//! parallel under a concurrency bound, writing one parquet snapshot per
//! dataset.
//!
//! # Example
//!
//! ```rust,ignore
//! use getl_core::extract::{ExtractContext, ExtractScheduler, ExtractorRegistry};
//!
//! let ctx = ExtractContext::from_settings(&settings);
//! let scheduler = ExtractScheduler::new(ExtractorRegistry::with_builtin(), ctx, &settings.raw_dir);
//! let result = scheduler.run_parallel_extract(&datasets, settings.max_concurrent_extracts).await;
//! println!("{} extracted, {} failed", result.succeeded.len(), result.failed.len());
//! ```

mod builtin;
mod cache;
mod error;
mod extractor;
mod registry;
mod scheduler;

pub use builtin::{FileExtractor, ParquetExtractor};
pub use cache::{DownloadCache, DownloadProgress, format_bytes};
pub use error::ExtractError;
pub use extractor::{
    ExtractContext, ExtractResult, Extractor, SharedDatabase, load_raw_table, snapshot_file, with_db,
};
pub use registry::{ExtractorFactory, ExtractorRegistry};
pub use scheduler::{ExtractScheduler, ParallelExtractResult};
