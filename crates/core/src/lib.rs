//! G-ETL core - geospatial ETL engine
//!
//! Extracts many datasets in parallel into parquet snapshots, transforms each
//! one through a chain of templated SQL migrations in its own ephemeral
//! DuckDB database, then merges every result into a shared warehouse.
//!
//! - [`settings`]: engine configuration
//! - [`catalog`]: dataset definitions
//! - [`templates`]: template discovery, rendering and schema chaining
//! - [`ledger`]: migration ledger (`migrate`, `rollback`, `status`)
//! - [`extract`]: extractor plugins and the bounded extraction scheduler
//! - [`transform`]: per-dataset template execution
//! - [`merge`]: warehouse merge and post-merge SQL
//! - [`pipeline`]: end-to-end orchestration

pub mod cancel;
pub mod catalog;
pub mod event;
pub mod settings;
pub mod sink;
pub mod templates;

#[cfg(feature = "engine")]
pub mod db;
#[cfg(feature = "engine")]
pub mod extract;
#[cfg(feature = "engine")]
pub mod ledger;
#[cfg(feature = "engine")]
pub mod merge;
#[cfg(feature = "engine")]
pub mod pipeline;
#[cfg(feature = "engine")]
pub mod transform;

#[cfg(feature = "progress")]
pub mod progress;

pub use cancel::CancellationFlag;
pub use catalog::{DatasetCatalog, DatasetConfig, DatasetFilter, FieldMapping, load_datasets};
pub use event::{EventKind, EventSink, PipelineEvent};
pub use settings::Settings;
pub use sink::LogSink;
pub use templates::{TemplateCatalog, TemplateGenerator, TemplateInfo, TemplateKind};

#[cfg(feature = "engine")]
pub use db::Database;
#[cfg(feature = "engine")]
pub use extract::{ExtractScheduler, Extractor, ExtractorRegistry};
#[cfg(feature = "engine")]
pub use ledger::Migrator;
#[cfg(feature = "engine")]
pub use pipeline::{PipelineError, PipelineReport, PipelineRunner, RunMode, RunOptions};
#[cfg(feature = "engine")]
pub use transform::{Phase, Phases, TransformExecutor};
