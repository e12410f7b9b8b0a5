//! Transform phase selection

use serde::{Deserialize, Serialize};

use crate::templates::TemplateKind;

/// A selectable transform phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// `*_staging_*` templates
    Staging,
    /// `*_staging2_*` / `*_staging_2_*` templates
    Staging2,
    /// `*_mart_*` templates
    Mart,
}

impl Phase {
    /// All phases in execution order
    pub fn all() -> Vec<Self> {
        vec![Self::Staging, Self::Staging2, Self::Mart]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Staging2 => "staging2",
            Self::Mart => "mart",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "staging" | "1" => Ok(Self::Staging),
            "staging2" | "staging_2" | "2" => Ok(Self::Staging2),
            "mart" | "3" => Ok(Self::Mart),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// Which template phases a transform run applies
///
/// Templates that belong to no phase always run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phases {
    pub staging: bool,
    pub staging_shared: bool,
    pub mart: bool,
}

impl Default for Phases {
    fn default() -> Self {
        Self::all()
    }
}

impl Phases {
    pub fn all() -> Self {
        Self {
            staging: true,
            staging_shared: true,
            mart: true,
        }
    }

    /// Enable exactly the listed phases; an empty list enables all
    pub fn only(phases: &[Phase]) -> Self {
        if phases.is_empty() {
            return Self::all();
        }
        Self {
            staging: phases.contains(&Phase::Staging),
            staging_shared: phases.contains(&Phase::Staging2),
            mart: phases.contains(&Phase::Mart),
        }
    }

    /// Whether templates of this kind run
    pub fn allows(&self, kind: TemplateKind) -> bool {
        match kind {
            TemplateKind::Staging => self.staging,
            TemplateKind::Staging2 => self.staging_shared,
            TemplateKind::Mart => self.mart,
            TemplateKind::Other => true,
        }
    }

    /// Names of the enabled phases
    pub fn enabled(&self) -> Vec<Phase> {
        Phase::all()
            .into_iter()
            .filter(|p| match p {
                Phase::Staging => self.staging,
                Phase::Staging2 => self.staging_shared,
                Phase::Mart => self.mart,
            })
            .collect()
    }
}
