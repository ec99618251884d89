//! Recipe family policy
//!
//! Aggregates the per-step analyses into one classification of how a recipe
//! behaves across Linux distribution families, and the list of Linux plan
//! targets that classification implies. Every consumer that needs to know
//! "which platforms does this recipe produce plans for" goes through
//! [`classify`] and [`plan_targets`].

use super::constraint::StepAnalysis;
use crate::core::platform::{Target, LINUX_FAMILIES, SUPPORTED_ARCH};
use crate::recipe::Recipe;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipeFamilyPolicy {
    /// No step can run on Linux.
    None,
    /// Linux steps exist and none depend on the family.
    Agnostic,
    /// Some Linux step interpolates `{linux_family}`.
    Varying,
    /// Every Linux step is restricted to a family.
    Specific,
    /// Both family-restricted and unrestricted Linux steps.
    Mixed,
}

impl fmt::Display for RecipeFamilyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecipeFamilyPolicy::None => "none",
            RecipeFamilyPolicy::Agnostic => "agnostic",
            RecipeFamilyPolicy::Varying => "varying",
            RecipeFamilyPolicy::Specific => "specific",
            RecipeFamilyPolicy::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

/// A Linux plan variant. `linux_family = None` is the generic entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PlatformTarget {
    pub os: String,
    pub linux_family: Option<String>,
}

impl PlatformTarget {
    fn generic() -> Self {
        Self {
            os: "linux".to_string(),
            linux_family: None,
        }
    }

    fn family(family: &str) -> Self {
        Self {
            os: "linux".to_string(),
            linux_family: Some(family.to_string()),
        }
    }
}

/// Classify a set of step analyses.
///
/// Family-specific targets come out in canonical family order, followed by
/// the generic entry for [`RecipeFamilyPolicy::Mixed`].
pub fn classify<'a, I>(analyses: I) -> (RecipeFamilyPolicy, Vec<PlatformTarget>)
where
    I: IntoIterator<Item = &'a StepAnalysis>,
{
    let linux: Vec<&StepAnalysis> = analyses
        .into_iter()
        .filter(|a| a.constraint.reaches_linux())
        .collect();

    if linux.is_empty() {
        return (RecipeFamilyPolicy::None, Vec::new());
    }

    if linux.iter().any(|a| a.family_varying) {
        let targets = LINUX_FAMILIES
            .iter()
            .map(|f| PlatformTarget::family(f))
            .collect();
        return (RecipeFamilyPolicy::Varying, targets);
    }

    let restricted: BTreeSet<&str> = linux
        .iter()
        .filter_map(|a| a.constraint.linux_family.as_deref())
        .collect();
    let unrestricted = linux.iter().any(|a| a.constraint.linux_family.is_none());

    let mut targets: Vec<PlatformTarget> = LINUX_FAMILIES
        .iter()
        .filter(|f| restricted.contains(*f))
        .map(|f| PlatformTarget::family(f))
        .collect();

    match (restricted.is_empty(), unrestricted) {
        (true, _) => (RecipeFamilyPolicy::Agnostic, vec![PlatformTarget::generic()]),
        (false, false) => (RecipeFamilyPolicy::Specific, targets),
        (false, true) => {
            targets.push(PlatformTarget::generic());
            (RecipeFamilyPolicy::Mixed, targets)
        }
    }
}

/// Classify a loaded recipe.
pub fn classify_recipe(recipe: &Recipe) -> (RecipeFamilyPolicy, Vec<PlatformTarget>) {
    classify(recipe.steps.iter().map(|s| s.analysis()))
}

/// Every concrete target a distinct plan should be compiled for.
///
/// Darwin targets are included for each architecture where at least one step
/// applies; Linux targets are the classifier's entries crossed with the
/// architectures.
pub fn plan_targets(recipe: &Recipe) -> Vec<Target> {
    let (_, linux_targets) = classify_recipe(recipe);
    let mut targets = Vec::new();

    for arch in SUPPORTED_ARCH {
        for entry in &linux_targets {
            let mut target = Target::new(entry.os.as_str(), *arch);
            target.linux_family = entry.linux_family.clone();
            if recipe.steps.iter().any(|s| s.applies_to(&target)) {
                targets.push(target);
            }
        }
    }
    for arch in SUPPORTED_ARCH {
        let target = Target::new("darwin", *arch);
        if recipe.steps.iter().any(|s| s.applies_to(&target)) {
            targets.push(target);
        }
    }
    targets
}
