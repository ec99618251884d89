//! Execution engine
//!
//! Runs a compiled [`InstallationPlan`] step by step in a private work
//! directory, commits the staged install into `tools/<name>-<version>`, and
//! only then records it in state and activates it. A failed or cancelled
//! run leaves state exactly as it was.

pub mod activate;
pub mod installer;
pub mod state;

use crate::actions::{ExecutionContext, HandlerRegistry, StepOutput};
use crate::core::config::Config;
use crate::core::lock::try_install_lock;
use crate::error::{ExecuteError, StateError};
use crate::plan::{InstallationPlan, PlanDirs, PlanStep};
use state::{StateManager, VersionState, check_version};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

pub use installer::{InstallReport, Installer};

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a successful [`Engine::execute`] did.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub tool: String,
    pub version: String,
    pub steps_run: usize,
    /// Binaries exposed by this version, relative to its directory.
    pub binaries: Vec<String>,
    pub install_dir: PathBuf,
    /// Active version before this install.
    pub previous_active: Option<String>,
    /// State entry this install overwrote, when the version was already installed.
    pub replaced: Option<VersionState>,
    /// Where the overwritten version directory was moved. Only set for
    /// engines built with [`Engine::keep_backup`].
    pub backup: Option<PathBuf>,
}

impl ExecutionResult {
    /// Drop the overwritten version directory, if one was kept.
    pub fn discard_backup(&mut self) {
        if let Some(backup) = self.backup.take() {
            remove_tree(&backup);
        }
    }
}

type StepCallback<'a> = Box<dyn Fn(usize, usize, &PlanStep) + 'a>;

pub struct Engine<'a> {
    config: &'a Config,
    handlers: &'a HandlerRegistry,
    cancel: CancelToken,
    explicit: bool,
    requested: String,
    keep_backup: bool,
    on_step: Option<StepCallback<'a>>,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a Config, handlers: &'a HandlerRegistry) -> Self {
        Self {
            config,
            handlers,
            cancel: CancelToken::new(),
            explicit: true,
            requested: crate::recipe::LATEST.to_string(),
            keep_backup: false,
            on_step: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record the tool as a dependency install rather than a user request.
    pub fn as_dependency(mut self) -> Self {
        self.explicit = false;
        self
    }

    /// Constraint the user asked for, stored with the version.
    pub fn requested(mut self, requested: &str) -> Self {
        self.requested = requested.to_string();
        self
    }

    /// Keep the previous directory of a reinstalled version next to the new
    /// one, so a caller can still roll back after checking the install.
    pub fn keep_backup(mut self) -> Self {
        self.keep_backup = true;
        self
    }

    /// Called before each step with `(position, total, step)`.
    pub fn on_step(mut self, f: impl Fn(usize, usize, &PlanStep) + 'a) -> Self {
        self.on_step = Some(Box::new(f));
        self
    }

    /// Run `plan` and record the result.
    ///
    /// `binaries` are the recipe's declared binaries; binaries reported by
    /// steps are added to them.
    pub fn execute(
        &self,
        plan: &InstallationPlan,
        binaries: &[String],
    ) -> Result<ExecutionResult, ExecuteError> {
        let tool = plan.tool.as_str();
        let version = plan.version.as_str();
        check_version(version)?;
        let io_error = |context: String| {
            move |source| ExecuteError::Io {
                tool: tool.to_string(),
                version: version.to_string(),
                context,
                source,
            }
        };

        let lock_path = self.config.work_root().join(format!("{}.lock", tool));
        let _lock = try_install_lock(&lock_path)
            .map_err(io_error(format!("cannot create lock {}", lock_path.display())))?
            .ok_or_else(|| ExecuteError::InstallLocked {
                tool: tool.to_string(),
                path: lock_path.clone(),
            })?;

        if let Some(step) = plan.steps.iter().find(|s| !self.handlers.contains(&s.action)) {
            return Err(ExecuteError::NoHandler {
                tool: tool.to_string(),
                version: version.to_string(),
                step: step.index,
                action: step.action.clone(),
            });
        }

        let dirs = PlanDirs::for_install(self.config, tool, version);
        if dirs.work_dir.exists() {
            tracing::debug!(dir = %dirs.work_dir.display(), "removing leftover work directory");
            std::fs::remove_dir_all(&dirs.work_dir).map_err(io_error(format!(
                "cannot clear {}",
                dirs.work_dir.display()
            )))?;
        }
        for dir in [&dirs.install_dir, &dirs.libs_dir] {
            std::fs::create_dir_all(dir)
                .map_err(io_error(format!("cannot create {}", dir.display())))?;
        }

        let mut ctx = ExecutionContext::new(
            tool,
            version,
            &dirs.install_dir,
            &dirs.work_dir,
            &dirs.libs_dir,
        );
        let output = match self.run_steps(plan, &mut ctx) {
            Ok(output) => output,
            Err(err) => {
                cleanup(&dirs.work_dir);
                return Err(err);
            }
        };

        let mut all_binaries: Vec<String> = binaries.to_vec();
        for binary in output.binaries {
            if !all_binaries.contains(&binary) {
                all_binaries.push(binary);
            }
        }

        let install_dir = self.config.tool_dir(tool, version);
        let committed = commit_install(&dirs.install_dir, &install_dir)
            .map_err(io_error(format!("cannot commit to {}", install_dir.display())));
        cleanup(&dirs.work_dir);
        let backup = committed?;

        // Links are swapped while the state lock is held so that state and
        // `tools/current` always move together.
        let entry = VersionState::new(&self.requested).with_binaries(all_binaries.clone());
        let recorded = StateManager::from_config(self.config).update(|state| {
            let previous_binaries = state
                .get(tool)
                .and_then(|t| t.active())
                .map(|v| v.binaries.clone())
                .unwrap_or_default();
            let replaced = state
                .get(tool)
                .and_then(|t| t.versions.get(version))
                .cloned();
            let previous =
                state.record_install(tool, version, entry, &plan.dependencies, self.explicit)?;
            for dep in plan
                .dependencies
                .install_time
                .keys()
                .chain(plan.dependencies.runtime.keys())
            {
                state.add_required_by(dep, tool);
            }
            activate::activate(self.config, tool, version, &all_binaries, &previous_binaries)?;
            Ok::<_, StateError>((previous, replaced))
        });
        let (previous_active, replaced) = match recorded {
            Ok(r) => r,
            Err(err) => {
                remove_tree(&install_dir);
                if let Some(backup) = &backup
                    && let Err(e) = std::fs::rename(backup, &install_dir)
                {
                    tracing::warn!(dir = %backup.display(), error = %e, "failed to restore previous install");
                }
                return Err(err.into());
            }
        };

        let mut result = ExecutionResult {
            tool: tool.to_string(),
            version: version.to_string(),
            steps_run: plan.steps.len(),
            binaries: all_binaries,
            install_dir,
            previous_active,
            replaced,
            backup,
        };
        if !self.keep_backup {
            result.discard_backup();
        }

        tracing::info!(tool, version, steps = plan.steps.len(), "installed");
        Ok(result)
    }

    fn run_steps(
        &self,
        plan: &InstallationPlan,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutput, ExecuteError> {
        let total = plan.steps.len();
        let mut output = StepOutput::default();

        for (position, step) in plan.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(tool = %plan.tool, completed = position, total, "install cancelled");
                return Err(ExecuteError::Cancelled {
                    tool: plan.tool.clone(),
                    version: plan.version.clone(),
                    completed: position,
                    total,
                });
            }
            if let Some(f) = &self.on_step {
                f(position + 1, total, step);
            }

            let handler = self
                .handlers
                .get(&step.action)
                .ok_or_else(|| ExecuteError::NoHandler {
                    tool: plan.tool.clone(),
                    version: plan.version.clone(),
                    step: step.index,
                    action: step.action.clone(),
                })?;

            tracing::debug!(step = step.index, action = %step.action, "running step");
            let produced =
                handler
                    .execute(ctx, step)
                    .map_err(|source| ExecuteError::StepFailed {
                        tool: plan.tool.clone(),
                        version: plan.version.clone(),
                        step: step.index,
                        action: step.action.clone(),
                        source,
                    })?;
            tracing::debug!(
                step = step.index,
                binaries = produced.binaries.len(),
                files = produced.files.len(),
                "step finished"
            );
            output.merge(produced);
        }
        Ok(output)
    }
}

fn cleanup(work_dir: &Path) {
    remove_tree(work_dir);
}

fn remove_tree(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to remove directory");
    }
}

/// Move the staged install to `dest`, replacing an existing directory.
///
/// An existing `dest` is moved to a `.<name>.old` sibling first and its path
/// returned; the caller decides when to drop it. A rename is tried first;
/// across filesystems the tree is copied.
pub fn commit_install(stage_dir: &Path, dest: &Path) -> std::io::Result<Option<PathBuf>> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let backup = backup_path(dest);
    let had_previous = dest.exists();
    if had_previous {
        let _ = std::fs::remove_dir_all(&backup);
        std::fs::rename(dest, &backup)?;
    }

    let result = match std::fs::rename(stage_dir, dest) {
        Ok(()) => Ok(()),
        Err(_) => copy_tree(stage_dir, dest),
    };

    match result {
        Ok(()) => Ok(had_previous.then_some(backup)),
        Err(e) => {
            let _ = std::fs::remove_dir_all(dest);
            if had_previous {
                let _ = std::fs::rename(&backup, dest);
            }
            Err(e)
        }
    }
}

fn backup_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.old", name))
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
