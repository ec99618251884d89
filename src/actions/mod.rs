//! Actions: the implicit-dependency registry and the handlers that run steps
//!
//! The [`registry`] describes what an action *needs* (dependencies,
//! platform constraint). Handlers describe what an action *does*. Only a few
//! primitives ship with a handler; everything else in the registry must be
//! supplied by the embedder through [`HandlerRegistry::register`].

pub mod archive;
pub mod command;
pub mod download;
pub mod files;
pub mod registry;

use crate::plan::PlanStep;
use crate::recipe::params::ParamValue;
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directories and accumulated environment for one install run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tool: String,
    pub version: String,
    /// Staging directory that becomes `tools/<name>-<version>` on success.
    pub install_dir: PathBuf,
    pub work_dir: PathBuf,
    pub libs_dir: PathBuf,
    /// Variables exported by `set_env`, visible to later commands.
    pub env: BTreeMap<String, String>,
    /// File written by the most recent `download` step.
    pub last_download: Option<PathBuf>,
}

impl ExecutionContext {
    pub fn new(
        tool: impl Into<String>,
        version: impl Into<String>,
        install_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        libs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool: tool.into(),
            version: version.into(),
            install_dir: install_dir.into(),
            work_dir: work_dir.into(),
            libs_dir: libs_dir.into(),
            env: BTreeMap::new(),
            last_download: None,
        }
    }

    /// Resolve a step path. Relative paths are taken from the work directory.
    pub fn work_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.work_dir.join(p)
        }
    }

    /// Resolve a step path. Relative paths are taken from the install directory.
    pub fn install_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.install_dir.join(p)
        }
    }
}

/// What a step produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// Binaries relative to the install directory, e.g. `bin/rg`.
    pub binaries: Vec<String>,
    pub files: Vec<PathBuf>,
}

impl StepOutput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            binaries: Vec::new(),
            files: vec![path.into()],
        }
    }

    pub fn merge(&mut self, other: StepOutput) {
        self.binaries.extend(other.binaries);
        self.files.extend(other.files);
    }
}

/// Runs one expanded plan step.
pub trait ActionHandler: Send + Sync {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput>;
}

impl<F> ActionHandler for F
where
    F: Fn(&mut ExecutionContext, &PlanStep) -> Result<StepOutput> + Send + Sync,
{
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        self(ctx, step)
    }
}

/// Action name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Box<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for the primitive actions.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        r.register("download", download::Download);
        r.register("extract", archive::Extract);
        r.register("chmod", files::Chmod);
        r.register("install_binaries", files::InstallBinaries);
        r.register("set_env", command::SetEnv);
        r.register("run_command", command::RunCommand);
        r.register("require_command", command::RequireCommand);
        r
    }

    /// Add or replace the handler for `action`.
    pub fn register(&mut self, action: &str, handler: impl ActionHandler + 'static) {
        self.handlers.insert(action.to_string(), Box::new(handler));
    }

    pub fn get(&self, action: &str) -> Option<&dyn ActionHandler> {
        self.handlers.get(action).map(|h| h.as_ref())
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

pub(crate) fn param<'a>(step: &'a PlanStep, key: &str) -> Option<&'a ParamValue> {
    step.params.get(key)
}

pub(crate) fn required_str<'a>(step: &'a PlanStep, key: &str) -> Result<&'a str> {
    match param(step, key) {
        Some(value) => value
            .as_str()
            .ok_or_else(|| anyhow!("parameter '{}' must be a string", key)),
        None => Err(anyhow!("missing required parameter '{}'", key)),
    }
}

pub(crate) fn optional_str<'a>(step: &'a PlanStep, key: &str) -> Result<Option<&'a str>> {
    param(step, key)
        .map(|value| {
            value
                .as_str()
                .ok_or_else(|| anyhow!("parameter '{}' must be a string", key))
        })
        .transpose()
}

pub(crate) fn string_list(step: &PlanStep, key: &str) -> Result<Vec<String>> {
    param(step, key)
        .with_context(|| format!("missing required parameter '{}'", key))?
        .as_string_list()
        .with_context(|| format!("parameter '{}' must be a list of strings", key))
}

#[cfg(test)]
pub(crate) fn test_step(action: &str, params: &[(&str, ParamValue)]) -> PlanStep {
    PlanStep {
        index: 0,
        action: action.to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        evaluable: true,
    }
}

#[cfg(test)]
pub(crate) fn test_context(root: &Path) -> ExecutionContext {
    let work = root.join("work");
    let install = work.join(".install");
    std::fs::create_dir_all(&install).unwrap();
    ExecutionContext::new("sample", "1.2.3", install, work, root.join("libs"))
}
