//! Template rendering

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::catalog::{TemplateCatalog, TemplateInfo};
use super::error::{TemplateError, TemplateResult};
use super::naming::{SchemaChain, schema_name};
use super::sections::Sections;
use crate::catalog::{DatasetConfig, EXTRA_DATA_SLOTS, FieldMapping};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{ ?([A-Za-z0-9_]+) ?\}\}").expect("valid placeholder regex"));

/// Variables substituted into one template for one dataset
pub type Variables = BTreeMap<String, String>;

/// A rendered template ready to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub template: TemplateInfo,
    /// Schema the template writes into
    pub schema: String,
    pub sql: String,
}

/// Renders templates for datasets
///
/// Template files are read once and cached by relative path for the lifetime
/// of the generator. Rendering is otherwise a pure function of the template,
/// the dataset and its pipeline.
#[derive(Debug)]
pub struct TemplateGenerator {
    catalog: TemplateCatalog,
    fallback_boundary: String,
    cache: RwLock<HashMap<String, Arc<str>>>,
}

impl TemplateGenerator {
    pub fn new(catalog: TemplateCatalog) -> Self {
        Self {
            catalog,
            fallback_boundary: "staging_004".to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Boundary schema used when no shared staging template exists
    pub fn with_fallback_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.fallback_boundary = boundary.into();
        self
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Up section of a template, or an empty string if the file is missing
    pub fn load(&self, relative_path: &str) -> TemplateResult<Arc<str>> {
        if let Some(hit) = self
            .cache
            .read()
            .ok()
            .and_then(|cache| cache.get(relative_path).cloned())
        {
            return Ok(hit);
        }

        let path = self.catalog.path_of(relative_path);
        let up: Arc<str> = if path.is_file() {
            let content =
                std::fs::read_to_string(&path).map_err(|e| TemplateError::io(&path, e))?;
            Arc::from(Sections::parse(&content).up)
        } else {
            debug!(template = relative_path, "Template file not found, rendering empty");
            Arc::from("")
        };

        if let Ok(mut cache) = self.cache.write() {
            cache
                .entry(relative_path.to_string())
                .or_insert_with(|| up.clone());
        }
        Ok(up)
    }

    /// Schema chain for datasets of a pipeline
    pub fn chain(&self, pipeline: Option<&str>) -> TemplateResult<SchemaChain> {
        let templates = self.catalog.list_templates(pipeline)?;
        Ok(SchemaChain::from_templates(&templates, &self.fallback_boundary))
    }

    /// Target schema of a template
    pub fn schema_name(&self, filename: &str, pipeline: Option<&str>) -> String {
        schema_name(filename, pipeline)
    }

    /// Source schema of a template
    pub fn prev_schema(&self, filename: &str, pipeline: Option<&str>) -> TemplateResult<String> {
        Ok(self.chain(pipeline)?.prev_schema(filename, pipeline))
    }

    /// Build the substitution map for one template and dataset
    pub fn build_variables(
        &self,
        template: &TemplateInfo,
        dataset_id: &str,
        mapping: &FieldMapping,
        chain: &SchemaChain,
    ) -> Variables {
        let scope = template.pipeline.as_deref();
        let mut vars = Variables::new();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set("dataset_id", dataset_id.to_string());
        set("schema", schema_name(&template.filename, scope));
        set("prev_schema", chain.prev_schema(&template.filename, scope));
        set(
            "source_id_column",
            mapping.source_id_column_name().to_string(),
        );
        set("geometry_column", mapping.geometry_column.clone());
        set(
            "h3_center_resolution",
            mapping.h3_center_resolution.to_string(),
        );
        set(
            "h3_polyfill_resolution",
            mapping.h3_polyfill_resolution.to_string(),
        );
        set("h3_line_resolution", mapping.h3_line_resolution.to_string());
        set("h3_point_resolution", mapping.h3_point_resolution.to_string());
        set(
            "h3_line_buffer_meters",
            mapping.h3_line_buffer_meters.to_string(),
        );
        set("klass", mapping.klass.clone());
        set("leverantor", mapping.leverantor.clone());
        set("source_id_expr", mapping.source_id_expr());
        set("grupp_expr", mapping.grupp_expr());
        set("typ_expr", mapping.typ_expr());
        for slot in 1..=EXTRA_DATA_SLOTS {
            set(&format!("data_{slot}_expr"), mapping.data_expr(slot));
        }
        vars
    }

    /// Render one template for a dataset
    pub fn render(
        &self,
        template: &TemplateInfo,
        dataset_id: &str,
        mapping: &FieldMapping,
        chain: &SchemaChain,
    ) -> TemplateResult<String> {
        let body = self.load(&template.relative_path)?;
        if body.is_empty() {
            return Ok(String::new());
        }
        let vars = self.build_variables(template, dataset_id, mapping, chain);
        Ok(substitute(&body, &vars))
    }

    /// Render a template by relative path
    ///
    /// `pipeline` is the dataset's pipeline; it selects which pipeline
    /// templates take part in schema chaining.
    pub fn render_template(
        &self,
        relative_path: &str,
        dataset_id: &str,
        mapping: &FieldMapping,
        pipeline: Option<&str>,
    ) -> TemplateResult<String> {
        let template = TemplateInfo::from_relative_path(relative_path)?;
        let chain = self.chain(pipeline)?;
        self.render(&template, dataset_id, mapping, &chain)
    }

    /// Render the full ordered chain for a dataset, skipping empty renders
    pub fn render_all(&self, dataset: &DatasetConfig) -> TemplateResult<Vec<RenderedTemplate>> {
        let pipeline = dataset.pipeline();
        let templates = self.catalog.list_templates(pipeline)?;
        let chain = SchemaChain::from_templates(&templates, &self.fallback_boundary);

        let mut rendered = Vec::with_capacity(templates.len());
        for template in templates {
            let sql = self.render(&template, &dataset.id, &dataset.field_mapping, &chain)?;
            if sql.is_empty() {
                continue;
            }
            rendered.push(RenderedTemplate {
                schema: schema_name(&template.filename, template.pipeline.as_deref()),
                template,
                sql,
            });
        }
        Ok(rendered)
    }
}

/// Replace `{{ name }}` / `{{name}}` placeholders; unknown names are left as is
pub fn substitute(template: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
