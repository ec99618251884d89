//! Version providers
//!
//! Turn a `(name, constraint)` pair into a concrete version before plan
//! compilation. Only exact pins and `"latest"` exist; there is no range
//! solving. Looking up what "latest" means upstream is an external concern,
//! so the providers here answer from tables the caller fills in.

use crate::recipe::LATEST;
use crate::engine::state::State;
use std::collections::BTreeMap;

pub trait VersionProvider {
    /// Resolve `constraint` for `name`, or explain why it can't be.
    fn resolve_version(&self, name: &str, constraint: &str) -> Result<String, String>;
}

/// Explicit version table. Exact pins resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct PinnedVersions {
    latest: BTreeMap<String, String>,
}

impl PinnedVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what "latest" means for `name`.
    pub fn with(mut self, name: &str, version: &str) -> Self {
        self.insert(name, version);
        self
    }

    pub fn insert(&mut self, name: &str, version: &str) {
        self.latest.insert(name.to_string(), version.to_string());
    }
}

impl VersionProvider for PinnedVersions {
    fn resolve_version(&self, name: &str, constraint: &str) -> Result<String, String> {
        if constraint != LATEST {
            return Ok(constraint.to_string());
        }
        self.latest
            .get(name)
            .cloned()
            .ok_or_else(|| "no version pinned for 'latest'".to_string())
    }
}

/// Answers from what is already installed.
#[derive(Debug, Clone, Default)]
pub struct InstalledVersions {
    installed: BTreeMap<String, (String, Vec<String>)>,
}

impl InstalledVersions {
    pub fn from_state(state: &State) -> Self {
        let installed = state
            .installed
            .iter()
            .map(|(name, tool)| {
                (
                    name.clone(),
                    (
                        tool.active_version.clone(),
                        tool.versions.keys().cloned().collect(),
                    ),
                )
            })
            .collect();
        Self { installed }
    }
}

impl VersionProvider for InstalledVersions {
    fn resolve_version(&self, name: &str, constraint: &str) -> Result<String, String> {
        let Some((active, versions)) = self.installed.get(name) else {
            return Err("not installed".to_string());
        };
        if constraint == LATEST {
            return Ok(active.clone());
        }
        if versions.iter().any(|v| v == constraint) {
            Ok(constraint.to_string())
        } else {
            Err(format!("version {} is not installed", constraint))
        }
    }
}

/// Tries each provider in turn; the first answer wins.
#[derive(Default)]
pub struct ChainProvider {
    providers: Vec<Box<dyn VersionProvider>>,
}

impl ChainProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, provider: impl VersionProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }
}

impl VersionProvider for ChainProvider {
    fn resolve_version(&self, name: &str, constraint: &str) -> Result<String, String> {
        let mut reasons = Vec::new();
        for provider in &self.providers {
            match provider.resolve_version(name, constraint) {
                Ok(version) => return Ok(version),
                Err(reason) => reasons.push(reason),
            }
        }
        if reasons.is_empty() {
            Err("no version providers configured".to_string())
        } else {
            Err(reasons.join("; "))
        }
    }
}
