//! Template discovery
//!
//! Shared templates live directly under the template root; pipeline-scoped
//! templates live in `{prefix}_{pipeline}` subdirectories where the
//! three-letter prefix only fixes directory sort order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{TemplateError, TemplateResult};

/// Filename suffix of per-dataset templates
pub const TEMPLATE_SUFFIX: &str = "_template.sql";

/// Filename suffix of post-merge SQL files
pub const MERGED_SUFFIX: &str = "_merged.sql";

/// Which part of the transform a template belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// `_staging_` templates
    Staging,
    /// `_staging2_` / `_staging_2_` templates
    Staging2,
    /// `_mart_` templates
    Mart,
    /// Anything else; always runs
    Other,
}

impl TemplateKind {
    /// Classify a template filename
    ///
    /// The second staging pass is checked first since its marker contains the
    /// plain staging marker.
    pub fn of(filename: &str) -> Self {
        let lower = filename.to_lowercase();
        if lower.contains("_staging2_") || lower.contains("_staging_2_") {
            TemplateKind::Staging2
        } else if lower.contains("_staging_") {
            TemplateKind::Staging
        } else if lower.contains("_mart_") {
            TemplateKind::Mart
        } else {
            TemplateKind::Other
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TemplateKind::Staging => "staging",
            TemplateKind::Staging2 => "staging2",
            TemplateKind::Mart => "mart",
            TemplateKind::Other => "other",
        }
    }
}

/// A discovered template file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    /// File name, e.g. `004_staging_transform_template.sql`
    pub filename: String,
    /// Path relative to the template root, e.g. `aab_ext_restr/001_staging_x_template.sql`
    pub relative_path: String,
    /// Pipeline the template is scoped to (None = shared)
    pub pipeline: Option<String>,
    /// Directory holding the template (None = shared)
    pub pipeline_dir: Option<String>,
    /// Ordinal parsed from the filename
    pub number: Option<u32>,
}

impl TemplateInfo {
    fn shared(filename: String) -> Self {
        Self {
            number: template_number(&filename),
            relative_path: filename.clone(),
            filename,
            pipeline: None,
            pipeline_dir: None,
        }
    }

    fn scoped(filename: String, dir: &str) -> Self {
        Self {
            number: template_number(&filename),
            relative_path: format!("{dir}/{filename}"),
            filename,
            pipeline: Some(pipeline_name_from_dir(dir).to_string()),
            pipeline_dir: Some(dir.to_string()),
        }
    }

    /// Describe a template from its path relative to the template root
    pub fn from_relative_path(relative_path: &str) -> TemplateResult<Self> {
        let invalid = || TemplateError::InvalidPath(relative_path.to_string());
        match relative_path.split_once('/') {
            None if relative_path.is_empty() => Err(invalid()),
            None => Ok(Self::shared(relative_path.to_string())),
            Some((dir, file)) if dir.is_empty() || file.is_empty() || file.contains('/') => {
                Err(invalid())
            }
            Some((dir, file)) => Ok(Self::scoped(file.to_string(), dir)),
        }
    }

    /// Whether the template applies to every dataset
    pub fn is_shared(&self) -> bool {
        self.pipeline.is_none()
    }

    pub fn kind(&self) -> TemplateKind {
        TemplateKind::of(&self.filename)
    }

    /// Ledger version of the template
    ///
    /// Shared templates use their ordinal (`004`); pipeline-scoped templates are
    /// qualified by their directory (`aab_ext_restr/001`) so ordinals of
    /// different pipelines never collide.
    pub fn version(&self) -> String {
        let ordinal = ordinal_prefix(&self.filename)
            .unwrap_or_else(|| self.filename.trim_end_matches(".sql"));
        match &self.pipeline_dir {
            Some(dir) => format!("{dir}/{ordinal}"),
            None => ordinal.to_string(),
        }
    }

    /// Ledger name of the template (file stem without its ordinal)
    pub fn migration_name(&self) -> String {
        let stem = self.filename.trim_end_matches(".sql");
        match stem.split_once('_') {
            Some((prefix, rest)) if is_ordinal(prefix) => rest.to_string(),
            _ => stem.to_string(),
        }
    }
}

/// Discovers templates under a root directory
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    root: PathBuf,
}

impl TemplateCatalog {
    /// Create a catalog over `root` (usually `sql/migrations`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pipeline subdirectories in sort order, skipping hidden and `_`-prefixed names
    pub fn list_pipeline_dirs(&self) -> TemplateResult<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in read_dir(&self.root)? {
            let entry = entry.map_err(|e| TemplateError::io(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            dirs.push(name);
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Directory of a named pipeline, if one exists
    pub fn pipeline_dir_for(&self, pipeline: &str) -> TemplateResult<Option<String>> {
        Ok(self
            .list_pipeline_dirs()?
            .into_iter()
            .find(|dir| pipeline_name_from_dir(dir) == pipeline))
    }

    /// Templates for a pipeline: shared templates first, then the pipeline's own
    ///
    /// Both groups are sorted by filename. Unknown pipelines get shared
    /// templates only.
    pub fn list_templates(&self, pipeline: Option<&str>) -> TemplateResult<Vec<TemplateInfo>> {
        let mut templates: Vec<TemplateInfo> = self
            .template_files(&self.root)?
            .into_iter()
            .map(TemplateInfo::shared)
            .collect();

        if let Some(pipeline) = pipeline {
            if let Some(dir) = self.pipeline_dir_for(pipeline)? {
                let scoped = self.template_files(&self.root.join(&dir))?;
                templates.extend(scoped.into_iter().map(|f| TemplateInfo::scoped(f, &dir)));
            }
        }
        Ok(templates)
    }

    /// Shared staging templates, sorted by filename
    pub fn shared_staging_templates(&self) -> TemplateResult<Vec<TemplateInfo>> {
        Ok(self
            .list_templates(None)?
            .into_iter()
            .filter(|t| t.kind() == TemplateKind::Staging && t.number.is_some())
            .collect())
    }

    /// Post-merge SQL files in the template root, sorted by filename
    pub fn merged_files(&self) -> TemplateResult<Vec<PathBuf>> {
        Ok(self
            .files_with_suffix(&self.root, MERGED_SUFFIX)?
            .into_iter()
            .map(|f| self.root.join(f))
            .collect())
    }

    /// Absolute path of a template by relative path
    pub fn path_of(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }

    fn template_files(&self, dir: &Path) -> TemplateResult<Vec<String>> {
        self.files_with_suffix(dir, TEMPLATE_SUFFIX)
    }

    fn files_with_suffix(&self, dir: &Path, suffix: &str) -> TemplateResult<Vec<String>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = format!(
            "{}/*{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            glob::Pattern::escape(suffix)
        );
        let mut files: Vec<String> = glob::glob(&pattern)
            .map_err(|e| TemplateError::Pattern(e.to_string()))?
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn read_dir(dir: &Path) -> TemplateResult<std::fs::ReadDir> {
    std::fs::read_dir(dir).map_err(|e| TemplateError::io(dir, e))
}

/// Pipeline name from a directory name
///
/// `aab_ext_restr` → `ext_restr`; names without a three-letter alphabetic
/// prefix are returned unchanged.
pub fn pipeline_name_from_dir(dir: &str) -> &str {
    match dir.split_once('_') {
        Some((prefix, rest))
            if prefix.len() == 3 && prefix.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            rest
        }
        _ => dir,
    }
}

/// Ordinal of a template filename (`004_staging_x_template.sql` → 4)
pub fn template_number(filename: &str) -> Option<u32> {
    ordinal_prefix(filename)?.parse().ok()
}

fn ordinal_prefix(filename: &str) -> Option<&str> {
    let prefix = filename.split('_').next()?;
    is_ordinal(prefix).then_some(prefix)
}

fn is_ordinal(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}
