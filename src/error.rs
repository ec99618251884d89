//! Error taxonomy
//!
//! One enum per failure class. Configuration, resolution and compilation
//! errors all surface before anything touches disk; execution, state and
//! verification errors carry enough context (tool, version, step, target)
//! for the caller to decide between retrying, rolling back and reporting.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors detected while loading a recipe.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("no recipe found for '{name}'")]
    NotFound { name: String },

    #[error("failed to read recipe {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse recipe '{name}': {source}")]
    Parse {
        name: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("recipe '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },

    #[error("recipe '{tool}' step {step} uses unknown action '{action}'")]
    UnknownAction {
        tool: String,
        step: usize,
        action: String,
    },

    #[error("recipe '{tool}' step {step} ({action}): constraint conflict: {reason}")]
    ConstraintConflict {
        tool: String,
        step: usize,
        action: String,
        reason: String,
    },

    #[error("recipe '{tool}' step {step} ({action}): invalid when clause: {reason}")]
    InvalidWhen {
        tool: String,
        step: usize,
        action: String,
        reason: String,
    },

    #[error("recipe '{tool}': malformed dependency declaration '{declaration}': {reason}")]
    InvalidDependency {
        tool: String,
        declaration: String,
        reason: String,
    },

    #[error("recipe '{tool}': invalid verify section: {reason}")]
    InvalidVerify { tool: String, reason: String },
}

/// Resolution errors. Nothing has been mutated when one of these is returned.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dependency cycle detected: {}", chain.join(" -> "))]
    CycleDetected { chain: Vec<String> },

    #[error("unknown dependency '{name}' required by '{required_by}'")]
    UnknownDependency { name: String, required_by: String },

    #[error("could not resolve version for '{name}' ({constraint}): {reason}")]
    UnresolvedVersion {
        name: String,
        constraint: String,
        reason: String,
    },

    #[error("recipe for dependency '{name}' failed to load: {source}")]
    Recipe {
        name: String,
        #[source]
        source: Box<RecipeError>,
    },
}

/// Plan compilation errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("recipe '{tool}' has no steps applicable to {target}")]
    NoApplicableSteps { tool: String, target: String },

    #[error(
        "recipe '{tool}' step {step} ({action}): parameter '{param}' has unresolved placeholder '{placeholder}' for {target}"
    )]
    UnexpandedPlaceholder {
        tool: String,
        step: usize,
        action: String,
        param: String,
        placeholder: String,
        target: String,
    },

    #[error("invalid version '{version}' for '{tool}': {reason}")]
    InvalidVersion {
        tool: String,
        version: String,
        reason: String,
    },
}

/// Execution errors. State for the tool is left as it was before the run.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("{tool}@{version}: no handler registered for action '{action}' (step {step})")]
    NoHandler {
        tool: String,
        version: String,
        step: usize,
        action: String,
    },

    #[error("{tool}@{version}: step {step} ({action}) failed: {source:#}")]
    StepFailed {
        tool: String,
        version: String,
        step: usize,
        action: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{tool}@{version}: cancelled after {completed} of {total} steps")]
    Cancelled {
        tool: String,
        version: String,
        completed: usize,
        total: usize,
    },

    #[error("{tool}: another install is in progress (lock {path})")]
    InstallLocked { tool: String, path: PathBuf },

    #[error("{tool}@{version}: {context}: {source}")]
    Io {
        tool: String,
        version: String,
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// State errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is locked by another process (waited {waited:?})")]
    StateLocked { path: PathBuf, waited: Duration },

    #[error("tool '{tool}' is not installed")]
    ToolNotInstalled { tool: String },

    #[error("version '{version}' of '{tool}' is not installed (installed: {})", installed.join(", "))]
    VersionNotInstalled {
        tool: String,
        version: String,
        installed: Vec<String>,
    },

    #[error("invalid version string '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Verification errors, kept apart from execution errors because the files
/// are already on disk when these are raised.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{tool}@{version}: expected '{expected}' in output of `{command}`, got: {output}")]
    VersionMismatch {
        tool: String,
        version: String,
        command: String,
        expected: String,
        output: String,
    },

    #[error("{tool}@{version}: pattern '{pattern}' not found in output of `{command}`: {output}")]
    PatternNotFound {
        tool: String,
        version: String,
        command: String,
        pattern: String,
        output: String,
    },

    #[error("{tool}@{version}: `{command}` exited with {actual:?}, expected {expected}")]
    ExitCode {
        tool: String,
        version: String,
        command: String,
        expected: i32,
        actual: Option<i32>,
    },

    #[error("{tool}: output-mode verification requires a non-empty reason")]
    MissingReason { tool: String },

    #[error("{tool}: output-mode verification requires a non-empty pattern")]
    MissingPattern { tool: String },

    #[error("{tool}: verification mode 'functional' is not yet supported, use mode = \"output\"")]
    FunctionalModeUnsupported { tool: String },

    #[error("{tool}: unknown verification mode '{mode}'")]
    UnknownMode { tool: String, mode: String },

    #[error("{tool}: recipe has no verify section")]
    NoVerifySection { tool: String },

    #[error("version '{version}' cannot be formatted as {format}: {reason}")]
    VersionFormat {
        version: String,
        format: String,
        reason: String,
    },

    #[error("{tool}@{version}: failed to run `{command}`: {source}")]
    Command {
        tool: String,
        version: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Umbrella error for the end-to-end install pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl Error {
    /// True when the failure happened after files were placed on disk.
    pub fn is_post_install(&self) -> bool {
        matches!(self, Error::Verify(_))
    }
}
