//! Run options

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationFlag;
use crate::transform::{Phase, Phases};

/// Which parts of the pipeline a run executes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Extract, transform, merge, post-merge
    #[default]
    Full,
    /// Extract only, leaving snapshots in the raw directory
    ExtractOnly,
    /// Transform existing snapshots, then merge
    TransformOnly,
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::ExtractOnly => "extract_only",
            Self::TransformOnly => "transform_only",
        }
    }

    pub fn extracts(&self) -> bool {
        !matches!(self, Self::TransformOnly)
    }

    pub fn transforms(&self) -> bool {
        !matches!(self, Self::ExtractOnly)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "full" => Ok(Self::Full),
            "extract_only" | "extract" => Ok(Self::ExtractOnly),
            "transform_only" | "transform" => Ok(Self::TransformOnly),
            _ => Err(format!("Unknown run mode: {}", s)),
        }
    }
}

/// Options for one pipeline run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Template phases to apply
    pub phases: Phases,
    /// Re-apply templates already in the ledger and start from clean temp databases
    pub force: bool,
    /// Extraction concurrency (settings default if unset)
    pub max_extracts: Option<usize>,
    /// Transform concurrency (settings default if unset)
    pub max_transforms: Option<usize>,
    /// Cooperative cancellation
    pub cancel: CancellationFlag,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run mode
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Restrict the transform to these phases (empty = all)
    pub fn with_phases(mut self, phases: &[Phase]) -> Self {
        self.phases = Phases::only(phases);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_max_extracts(mut self, n: usize) -> Self {
        self.max_extracts = Some(n);
        self
    }

    pub fn with_max_transforms(mut self, n: usize) -> Self {
        self.max_transforms = Some(n);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> Result<(), String> {
        if self.max_extracts == Some(0) {
            return Err("max_extracts must be at least 1".to_string());
        }
        if self.max_transforms == Some(0) {
            return Err("max_transforms must be at least 1".to_string());
        }
        if self.mode.transforms() && self.phases.enabled().is_empty() {
            return Err("At least one transform phase must be enabled".to_string());
        }
        Ok(())
    }
}
