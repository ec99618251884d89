//! Per-step platform constraints
//!
//! A step's effective constraint is the conjunction of the action's implicit
//! constraint (from the action registry) and the step's explicit `when`
//! clause. An empty dimension means "any". The merge happens once, at recipe
//! load, and conflicts are rejected there rather than at plan time.

use crate::core::platform::{self, Target};
use crate::recipe::params::{visit_params, Params};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Placeholders whose value depends on the target platform.
fn platform_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{(linux_family|os|arch)\}").expect("regex for platform placeholders")
    })
}

/// Restriction on where a step may run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub os: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub arch: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_family: Option<String>,
}

impl Constraint {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn os(os: &str) -> Self {
        Self {
            os: BTreeSet::from([os.to_string()]),
            ..Self::default()
        }
    }

    /// Linux restricted to one distribution family.
    pub fn family(family: &str) -> Self {
        Self {
            os: BTreeSet::from(["linux".to_string()]),
            arch: BTreeSet::new(),
            linux_family: Some(family.to_string()),
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        self.os.is_empty() && self.arch.is_empty() && self.linux_family.is_none()
    }

    pub fn allows_os(&self, os: &str) -> bool {
        self.os.is_empty() || self.os.contains(os)
    }

    /// Whether any Linux target can satisfy this constraint.
    pub fn reaches_linux(&self) -> bool {
        self.allows_os("linux")
    }

    pub fn matches(&self, target: &Target) -> bool {
        if !self.allows_os(&target.os) {
            return false;
        }
        if !self.arch.is_empty() && !self.arch.contains(&target.arch) {
            return false;
        }
        match &self.linux_family {
            Some(family) => target.linux_family.as_deref() == Some(family.as_str()),
            None => true,
        }
    }

    /// Conjunction of two constraints. Returns the conflict description when
    /// no target could satisfy both.
    pub fn merge(&self, other: &Constraint) -> Result<Constraint, String> {
        let os = intersect("os", &self.os, &other.os)?;
        let arch = intersect("arch", &self.arch, &other.arch)?;
        let linux_family = match (&self.linux_family, &other.linux_family) {
            (Some(a), Some(b)) if a != b => {
                return Err(format!(
                    "linux_family '{}' conflicts with linux_family '{}'",
                    a, b
                ));
            }
            (Some(a), _) => Some(a.clone()),
            (None, b) => b.clone(),
        };

        let merged = Constraint {
            os,
            arch,
            linux_family,
        };
        merged.normalized()
    }

    /// A family restriction implies Linux; anything else is a conflict.
    fn normalized(mut self) -> Result<Constraint, String> {
        if let Some(family) = &self.linux_family {
            if !self.os.is_empty() && !self.os.contains("linux") {
                return Err(format!(
                    "linux_family '{}' cannot apply to os {}",
                    family,
                    join(&self.os)
                ));
            }
            self.os = BTreeSet::from(["linux".to_string()]);
        }
        Ok(self)
    }
}

fn intersect(
    axis: &str,
    a: &BTreeSet<String>,
    b: &BTreeSet<String>,
) -> Result<BTreeSet<String>, String> {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => Ok(b.clone()),
        (_, true) => Ok(a.clone()),
        _ => {
            let both: BTreeSet<String> = a.intersection(b).cloned().collect();
            if both.is_empty() {
                Err(format!("{} {} conflicts with {} {}", axis, join(a), axis, join(b)))
            } else {
                Ok(both)
            }
        }
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join("|")
}

/// A step's explicit trigger.
///
/// `platform` lists exact `os/arch` tuples and is mutually exclusive with
/// `os`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenClause {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "one_or_many")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_family: Option<String>,
}

impl WhenClause {
    pub fn is_empty(&self) -> bool {
        self.platform.is_empty()
            && self.os.is_empty()
            && self.arch.is_none()
            && self.linux_family.is_none()
    }

    /// Per-axis projection of this clause, validating every value.
    pub fn to_constraint(&self) -> Result<Constraint, String> {
        if !self.platform.is_empty() && !self.os.is_empty() {
            return Err("'platform' and 'os' are mutually exclusive".to_string());
        }

        let mut constraint = Constraint::default();
        for tuple in &self.platform {
            let (os, arch) = parse_platform_tuple(tuple)?;
            constraint.os.insert(os.to_string());
            constraint.arch.insert(arch.to_string());
        }
        for os in &self.os {
            if !platform::is_known_os(os) {
                return Err(format!("unknown os '{}'", os));
            }
            constraint.os.insert(os.clone());
        }
        if let Some(arch) = &self.arch {
            if !platform::is_known_arch(arch) {
                return Err(format!("unknown arch '{}'", arch));
            }
            if !self.platform.is_empty() {
                return Err("'arch' cannot be combined with 'platform'".to_string());
            }
            constraint.arch.insert(arch.clone());
        }
        if let Some(family) = &self.linux_family {
            if !platform::is_known_family(family) {
                return Err(format!("unknown linux_family '{}'", family));
            }
            constraint.linux_family = Some(family.clone());
        }
        Ok(constraint)
    }

    /// Exact match, honouring platform tuples that the per-axis constraint
    /// can only approximate.
    pub fn matches(&self, target: &Target) -> bool {
        if !self.platform.is_empty() {
            let tuple = format!("{}/{}", target.os, target.arch);
            if !self.platform.iter().any(|p| *p == tuple) {
                return false;
            }
        } else if !self.os.is_empty() && !self.os.contains(&target.os) {
            return false;
        }
        if let Some(arch) = &self.arch
            && *arch != target.arch
        {
            return false;
        }
        match &self.linux_family {
            Some(family) => target.linux_family.as_deref() == Some(family.as_str()),
            None => true,
        }
    }
}

fn parse_platform_tuple(tuple: &str) -> Result<(&str, &str), String> {
    let (os, arch) = tuple
        .split_once('/')
        .ok_or_else(|| format!("platform '{}' must be os/arch", tuple))?;
    if !platform::is_known_os(os) {
        return Err(format!("unknown os '{}' in platform '{}'", os, tuple));
    }
    if !platform::is_known_arch(arch) {
        return Err(format!("unknown arch '{}' in platform '{}'", arch, tuple));
    }
    Ok((os, arch))
}

/// Result of analyzing one step. Computed once at recipe load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepAnalysis {
    pub constraint: Constraint,
    /// Some parameter interpolates `{linux_family}`.
    pub family_varying: bool,
    /// Platform placeholders referenced by the step's parameters.
    pub platform_vars: BTreeSet<String>,
}

/// Why a step could not be analyzed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    InvalidWhen(String),
    Conflict(String),
}

/// Merge the action's implicit constraint with the step's trigger and scan
/// the parameters for platform placeholders.
pub fn analyze(
    action_constraint: &Constraint,
    when: Option<&WhenClause>,
    params: &Params,
) -> Result<StepAnalysis, AnalysisError> {
    let explicit = match when {
        Some(when) => when.to_constraint().map_err(AnalysisError::InvalidWhen)?,
        None => Constraint::unconstrained(),
    };
    let constraint = action_constraint
        .merge(&explicit)
        .map_err(AnalysisError::Conflict)?;

    let platform_vars = platform_vars(params);
    Ok(StepAnalysis {
        family_varying: platform_vars.contains("linux_family"),
        constraint,
        platform_vars,
    })
}

/// Every platform placeholder used anywhere in `params`.
pub fn platform_vars(params: &Params) -> BTreeSet<String> {
    let re = platform_var_regex();
    let mut found = BTreeSet::new();
    visit_params(params, |_, value| {
        for cap in re.captures_iter(value) {
            if let Some(name) = cap.get(1) {
                found.insert(name.as_str().to_string());
            }
        }
    });
    found
}

mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S: Serializer>(values: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        })
    }
}
