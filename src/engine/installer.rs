//! End-to-end install pipeline and the version-management entry points
//!
//! `install` = look up recipe → pin version → resolve dependencies →
//! install missing dependencies (dependencies first) → compile → execute →
//! verify, with the configured verification failure policy applied last.

use super::activate;
use super::state::StateManager;
use super::{CancelToken, Engine, ExecutionResult};
use crate::actions::HandlerRegistry;
use crate::core::config::{Config, VerifyFailurePolicy};
use crate::core::platform::Target;
use crate::deps::version::VersionProvider;
use crate::deps::{ResolvedDependencySet, Resolver};
use crate::error::{CompileError, Error, RecipeError, ResolveError, StateError, VerifyError};
use crate::plan::{self, InstallationPlan, PlanDirs, PlanInput, PlanStep};
use crate::recipe::index::RecipeIndex;
use crate::recipe::{LATEST, Recipe, VerifySpec};
use crate::verify::{CommandRunner, ShellRunner, VerificationOutcome, Verifier};
use std::sync::Arc;

/// Host target, with the configured family override applied.
pub fn default_target(config: &Config) -> Target {
    let mut target = Target::host();
    if target.is_linux()
        && let Some(family) = &config.linux_family
    {
        target.linux_family = Some(family.clone());
    }
    target
}

/// Everything an install did.
#[derive(Debug)]
pub struct InstallReport {
    pub plan: InstallationPlan,
    pub result: ExecutionResult,
    /// Dependencies installed on the way, as `(name, version)`.
    pub dependencies_installed: Vec<(String, String)>,
    /// `None` when verification was skipped or the recipe has no verify section.
    pub verification: Option<VerificationOutcome>,
}

type ProgressCallback<'a> = Box<dyn Fn(&str, usize, usize, &PlanStep) + 'a>;

pub struct Installer<'a, R = ShellRunner> {
    config: &'a Config,
    index: &'a RecipeIndex,
    handlers: &'a HandlerRegistry,
    verifier: Verifier<R>,
    target: Target,
    verify: bool,
    install_dependencies: bool,
    cancel: CancelToken,
    progress: Option<ProgressCallback<'a>>,
}

impl<'a> Installer<'a> {
    pub fn new(config: &'a Config, index: &'a RecipeIndex, handlers: &'a HandlerRegistry) -> Self {
        Self {
            config,
            index,
            handlers,
            verifier: Verifier::default(),
            target: default_target(config),
            verify: true,
            install_dependencies: true,
            cancel: CancelToken::new(),
            progress: None,
        }
    }
}

impl<'a, R: CommandRunner> Installer<'a, R> {
    pub fn with_verifier<R2: CommandRunner>(self, verifier: Verifier<R2>) -> Installer<'a, R2> {
        Installer {
            config: self.config,
            index: self.index,
            handlers: self.handlers,
            verifier,
            target: self.target,
            verify: self.verify,
            install_dependencies: self.install_dependencies,
            cancel: self.cancel,
            progress: self.progress,
        }
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn skip_verify(mut self) -> Self {
        self.verify = false;
        self
    }

    pub fn skip_dependencies(mut self) -> Self {
        self.install_dependencies = false;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called before each step with `(tool, position, total, step)`.
    pub fn on_step(mut self, f: impl Fn(&str, usize, usize, &PlanStep) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn current_target(&self) -> &Target {
        &self.target
    }

    fn recipe(&self, name: &str) -> Result<Arc<Recipe>, RecipeError> {
        self.index
            .resolve(name)?
            .ok_or_else(|| RecipeError::NotFound {
                name: name.to_string(),
            })
    }

    fn resolver(&self) -> Resolver<'a> {
        Resolver::new(self.index).for_os(&self.target.os)
    }

    fn compile(
        &self,
        recipe: &Recipe,
        version: &str,
        dependencies: &ResolvedDependencySet,
    ) -> Result<InstallationPlan, CompileError> {
        let dirs = PlanDirs::for_install(self.config, recipe.name(), version);
        plan::compile(
            PlanInput {
                recipe,
                version,
                dependencies,
                target: &self.target,
                dirs: &dirs,
            },
            self.index.registry(),
        )
    }

    /// Compile the plan `install` would run, without running it.
    pub fn plan(
        &self,
        tool: &str,
        constraint: &str,
        provider: &dyn VersionProvider,
    ) -> Result<InstallationPlan, Error> {
        let recipe = self.recipe(tool)?;
        let version = pin(recipe.name(), constraint, provider)?;
        let resolution = self.resolver().resolve(&recipe, provider)?;
        Ok(self.compile(&recipe, &version, &resolution.dependencies)?)
    }

    /// Install `tool` at `constraint`.
    pub fn install(
        &self,
        tool: &str,
        constraint: &str,
        provider: &dyn VersionProvider,
    ) -> Result<InstallReport, Error> {
        let recipe = self.recipe(tool)?;
        let name = recipe.name();
        let version = pin(name, constraint, provider)?;
        let resolution = self.resolver().resolve(&recipe, provider)?;
        let plan = self.compile(&recipe, &version, &resolution.dependencies)?;

        let mut dependencies_installed = Vec::new();
        if self.install_dependencies {
            let state = StateManager::from_config(self.config).load()?;
            for dep in resolution.graph.install_order()? {
                let dep_version = match resolution.dependencies.version_of(&dep) {
                    Some(v) => v.to_string(),
                    None => pin(&dep, LATEST, provider)?,
                };
                if state
                    .get(&dep)
                    .is_some_and(|t| t.versions.contains_key(&dep_version))
                {
                    tracing::debug!(dependency = %dep, version = %dep_version, "already installed");
                    continue;
                }

                let dep_recipe = self.recipe(&dep)?;
                let dep_resolution = self.resolver().resolve(&dep_recipe, provider)?;
                let dep_plan =
                    self.compile(&dep_recipe, &dep_version, &dep_resolution.dependencies)?;
                self.execute(&dep_plan, &dep_recipe, LATEST, false)?
                    .discard_backup();
                dependencies_installed.push((dep, dep_version));
            }
        }

        let mut result = self.execute(&plan, &recipe, constraint, true)?;

        let verification = match (&recipe.verify, self.verify) {
            (Some(spec), true) => Some(self.check(&recipe, spec, &result)?),
            _ => None,
        };
        result.discard_backup();

        Ok(InstallReport {
            plan,
            result,
            dependencies_installed,
            verification,
        })
    }

    fn execute(
        &self,
        plan: &InstallationPlan,
        recipe: &Recipe,
        requested: &str,
        explicit: bool,
    ) -> Result<ExecutionResult, Error> {
        let mut engine = Engine::new(self.config, self.handlers)
            .with_cancel(self.cancel.clone())
            .requested(requested)
            .keep_backup();
        if !explicit {
            engine = engine.as_dependency();
        }
        if let Some(progress) = &self.progress {
            let tool = plan.tool.clone();
            engine = engine.on_step(move |position, total, step| {
                progress(&tool, position, total, step)
            });
        }
        Ok(engine.execute(plan, &recipe.metadata.binaries)?)
    }

    fn check(
        &self,
        recipe: &Recipe,
        spec: &VerifySpec,
        result: &ExecutionResult,
    ) -> Result<VerificationOutcome, Error> {
        let failure = match self.verifier.verify(
            &result.tool,
            &result.version,
            &result.install_dir,
            spec,
        ) {
            Ok(outcome) if outcome.passed => return Ok(outcome),
            Ok(outcome) => outcome,
            Err(err) => VerificationOutcome {
                passed: false,
                output: String::new(),
                expected: String::new(),
                transformed_version: None,
                failure: Some(err),
            },
        };

        match self.config.verify_failure {
            VerifyFailurePolicy::Warn => {
                tracing::warn!(
                    tool = recipe.name(),
                    version = %result.version,
                    error = ?failure.failure,
                    "verification failed, keeping install"
                );
                Ok(failure)
            }
            VerifyFailurePolicy::Rollback => {
                let mut failure = failure;
                let err = failure.failure.take().unwrap_or_else(|| {
                    VerifyError::PatternNotFound {
                        tool: result.tool.clone(),
                        version: result.version.clone(),
                        command: spec.command.clone(),
                        pattern: failure.expected.clone(),
                        output: failure.output.clone(),
                    }
                });
                tracing::warn!(
                    tool = recipe.name(),
                    version = %result.version,
                    error = %err,
                    "verification failed, rolling back"
                );
                rollback(self.config, result)?;
                Err(err.into())
            }
        }
    }
}

/// Resolve `constraint` for `name` through `provider`.
pub fn pin(
    name: &str,
    constraint: &str,
    provider: &dyn VersionProvider,
) -> Result<String, ResolveError> {
    provider
        .resolve_version(name, constraint)
        .map_err(|reason| ResolveError::UnresolvedVersion {
            name: name.to_string(),
            constraint: constraint.to_string(),
            reason,
        })
}

/// Undo the install described by `result` and bring the previously active
/// version back.
///
/// A reinstall of an already installed version gets its old directory and
/// state entry back when `result` still carries the backup; otherwise the
/// version is removed.
pub fn rollback(config: &Config, result: &ExecutionResult) -> Result<(), StateError> {
    let tool = result.tool.as_str();
    let version = result.version.as_str();
    let dir = config.tool_dir(tool, version);
    let restore = result.replaced.as_ref().zip(result.backup.as_ref());

    StateManager::from_config(config).update(|state| {
        let new_binaries = state
            .get(tool)
            .and_then(|t| t.versions.get(version))
            .map(|v| v.binaries.clone())
            .unwrap_or_default();
        match restore {
            Some((entry, backup)) => {
                remove_version_dir(config, tool, version);
                std::fs::rename(backup, &dir).map_err(|source| StateError::Io {
                    path: dir.clone(),
                    source,
                })?;
                state.restore_version(tool, version, entry.clone())?;
            }
            None => {
                state.remove_version(tool, version)?;
            }
        }
        if let Some(previous) = result.previous_active.as_deref()
            && state
                .get(tool)
                .is_some_and(|t| t.versions.contains_key(previous))
        {
            state.activate(tool, previous)?;
        }

        let active = state.get(tool).map(|t| {
            (
                t.active_version.clone(),
                t.active().map(|v| v.binaries.clone()).unwrap_or_default(),
            )
        });
        match active {
            Some((active_version, binaries)) => {
                activate::activate(config, tool, &active_version, &binaries, &new_binaries)
            }
            None => activate::deactivate(config, tool, &new_binaries),
        }
    })?;

    if restore.is_none() {
        remove_version_dir(config, tool, version);
        if let Some(backup) = &result.backup {
            remove_version_dir_at(backup);
        }
    }
    tracing::info!(tool, version, restored = restore.is_some(), "rolled back");
    Ok(())
}

/// Outcome of [`remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalReport {
    pub tool: String,
    pub removed_versions: Vec<String>,
    /// Active version afterwards; `None` when the tool is gone.
    pub active_version: Option<String>,
    /// Tools that still depend on the removed tool.
    pub required_by: Vec<String>,
}

/// Remove one version of `tool`, or the whole tool when `version` is `None`.
pub fn remove(
    config: &Config,
    tool: &str,
    version: Option<&str>,
) -> Result<RemovalReport, StateError> {
    let manager = StateManager::from_config(config);
    match version {
        Some(version) => {
            let (removal, required_by) = manager.update(|state| {
                let required_by: Vec<String> = state
                    .get(tool)
                    .map(|t| t.required_by.iter().cloned().collect())
                    .unwrap_or_default();
                let removal = state.remove_version(tool, version)?;
                let active_binaries = state
                    .get(tool)
                    .and_then(|t| t.active())
                    .map(|v| v.binaries.clone())
                    .unwrap_or_default();
                match &removal.active_version {
                    None => activate::deactivate(config, tool, &removal.removed.binaries)?,
                    Some(active) if removal.reactivated => activate::activate(
                        config,
                        tool,
                        active,
                        &active_binaries,
                        &removal.removed.binaries,
                    )?,
                    Some(_) => {}
                }
                Ok::<_, StateError>((removal, required_by))
            })?;
            remove_version_dir(config, tool, version);

            Ok(RemovalReport {
                tool: tool.to_string(),
                removed_versions: vec![version.to_string()],
                active_version: removal.active_version,
                required_by,
            })
        }
        None => {
            let removed = manager.update(|state| {
                let removed = state.remove_tool(tool)?;
                let mut binaries: Vec<String> = Vec::new();
                for entry in removed.versions.values() {
                    for binary in &entry.binaries {
                        if !binaries.contains(binary) {
                            binaries.push(binary.clone());
                        }
                    }
                }
                activate::deactivate(config, tool, &binaries)?;
                Ok::<_, StateError>(removed)
            })?;

            let versions: Vec<String> = removed.versions.keys().cloned().collect();
            for version in &versions {
                remove_version_dir(config, tool, version);
            }
            Ok(RemovalReport {
                tool: tool.to_string(),
                removed_versions: versions,
                active_version: None,
                required_by: removed.required_by.into_iter().collect(),
            })
        }
    }
}

/// Make an installed version active, in state and on disk.
///
/// The links are swapped under the state lock, so concurrent switches leave
/// state and `tools/current` agreeing on the winner.
pub fn switch_version(config: &Config, tool: &str, version: &str) -> Result<(), StateError> {
    StateManager::from_config(config).update(|state| {
        let previous = state
            .get(tool)
            .and_then(|t| t.active())
            .map(|v| v.binaries.clone())
            .unwrap_or_default();
        let record = state.activate(tool, version)?;
        let binaries = record
            .active()
            .map(|v| v.binaries.clone())
            .unwrap_or_default();
        activate::activate(config, tool, version, &binaries, &previous)
    })
}

fn remove_version_dir(config: &Config, tool: &str, version: &str) {
    remove_version_dir_at(&config.tool_dir(tool, version));
}

fn remove_version_dir_at(dir: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to remove version directory");
    }
}
