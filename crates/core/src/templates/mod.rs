//! SQL template catalog and generator
//!
//! Templates are ordered SQL files applied once per dataset during the
//! transform. The catalog discovers them, the generator renders their
//! `{{ placeholder }}` tokens from a dataset's field mapping and computes the
//! schema each one reads from and writes to.
//!
//! # Example
//!
//! ```rust,ignore
//! use getl_core::catalog::DatasetConfig;
//! use getl_core::templates::{TemplateCatalog, TemplateGenerator};
//!
//! let generator = TemplateGenerator::new(TemplateCatalog::new("sql/migrations"));
//! let dataset = DatasetConfig::new("naturreservat", "wfs").with_pipeline("ext_restr");
//! for step in generator.render_all(&dataset)? {
//!     println!("{} -> {}", step.template.relative_path, step.schema);
//! }
//! ```

mod catalog;
mod error;
mod generator;
mod naming;
mod sections;

pub use catalog::{
    MERGED_SUFFIX, TEMPLATE_SUFFIX, TemplateCatalog, TemplateInfo, TemplateKind,
    pipeline_name_from_dir, template_number,
};
pub use error::{TemplateError, TemplateResult};
pub use generator::{RenderedTemplate, TemplateGenerator, Variables, substitute};
pub use naming::{MART_SCHEMA, RAW_SCHEMA, SchemaChain, schema_create_sql, schema_name};
pub use sections::{Sections, has_statements};
