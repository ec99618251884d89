//! Multi-version installation state
//!
//! `state.json` holds one [`ToolState`] per installed tool. Every mutation
//! goes through [`StateManager::update`], which holds an exclusive lock on
//! `state.json.lock` for the whole read-modify-write and replaces the file
//! by writing a temporary sibling and renaming it over the original.
//!
//! Invariants kept by every method here:
//! - a tool entry never has an empty `versions` map;
//! - `active_version` always keys into `versions`;
//! - removing the last version removes the entry.

use crate::core::config::Config;
use crate::core::lock::{FileLock, LockError, LockMode};
use crate::core::version_cmp::compare_versions;
use crate::deps::ResolvedDependencySet;
use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current on-disk schema.
pub const SCHEMA_VERSION: u32 = 2;

/// Characters that must never appear in a version used as a path component.
const FORBIDDEN_VERSION_CHARS: &[char] = &[
    '/', '\\', ';', '|', '&', '$', '`', '(', ')', '[', ']', '{', '}', '\'', '"', '<', '>', '*', '?',
];

/// Check a version string before it is used to build a path.
pub fn validate_version_string(version: &str) -> Result<(), String> {
    if version.is_empty() {
        return Err("version is empty".to_string());
    }
    if version.contains("..") {
        return Err("version contains '..'".to_string());
    }
    if version.chars().any(char::is_whitespace) {
        return Err("version contains whitespace".to_string());
    }
    if let Some(c) = version.chars().find(|c| FORBIDDEN_VERSION_CHARS.contains(c)) {
        return Err(format!("version contains forbidden character '{}'", c));
    }
    Ok(())
}

/// [`validate_version_string`] as a [`StateError`].
pub fn check_version(version: &str) -> Result<(), StateError> {
    validate_version_string(version).map_err(|reason| StateError::InvalidVersion {
        version: version.to_string(),
        reason,
    })
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

fn default_true() -> bool {
    true
}

/// One installed version of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    /// Constraint the user asked for, e.g. `"17"` or `"latest"`.
    pub requested: String,
    #[serde(default)]
    pub binaries: Vec<String>,
    #[serde(default = "epoch")]
    pub installed_at: DateTime<Utc>,
}

impl VersionState {
    pub fn new(requested: &str) -> Self {
        Self {
            requested: requested.to_string(),
            binaries: Vec::new(),
            installed_at: Utc::now(),
        }
    }

    pub fn with_binaries(mut self, binaries: Vec<String>) -> Self {
        self.binaries = binaries;
        self
    }

    pub fn installed_at(mut self, at: DateTime<Utc>) -> Self {
        self.installed_at = at;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub active_version: String,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionState>,

    // Single-version records written before schema 2. Read, never written.
    #[serde(default, skip_serializing)]
    version: Option<String>,
    #[serde(default, skip_serializing)]
    binaries: Vec<String>,

    /// Pinned install-time dependencies of the active version.
    #[serde(default)]
    pub install_dependencies: BTreeMap<String, String>,
    /// Pinned runtime dependencies of the active version.
    #[serde(default)]
    pub runtime_dependencies: BTreeMap<String, String>,
    /// Installed because the user asked for it, not only as a dependency.
    #[serde(default = "default_true")]
    pub is_explicit: bool,
    /// Tools that pulled this one in as a dependency.
    #[serde(default)]
    pub required_by: BTreeSet<String>,
}

impl ToolState {
    /// A tool with a single, active version.
    pub fn new(version: &str, state: VersionState) -> Self {
        Self {
            active_version: version.to_string(),
            versions: BTreeMap::from([(version.to_string(), state)]),
            version: None,
            binaries: Vec::new(),
            install_dependencies: BTreeMap::new(),
            runtime_dependencies: BTreeMap::new(),
            is_explicit: true,
            required_by: BTreeSet::new(),
        }
    }

    /// Add (or replace) a version. Prior versions are kept.
    pub fn add_version(&mut self, version: &str, state: VersionState, activate: bool) {
        self.versions.insert(version.to_string(), state);
        if activate || !self.versions.contains_key(&self.active_version) {
            self.active_version = version.to_string();
        }
    }

    /// Make `version` active. Returns false if it isn't installed.
    pub fn activate(&mut self, version: &str) -> bool {
        if !self.versions.contains_key(version) {
            return false;
        }
        self.active_version = version.to_string();
        true
    }

    /// Remove one version, reassigning the active version to the most
    /// recently installed remaining one if needed.
    pub fn remove_version(&mut self, version: &str) -> Option<VersionState> {
        let removed = self.versions.remove(version)?;
        if self.active_version == version {
            self.active_version = self.most_recent().unwrap_or_default().to_string();
        }
        Some(removed)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn active(&self) -> Option<&VersionState> {
        self.versions.get(&self.active_version)
    }

    /// Latest `installed_at`; ties go to the higher version.
    pub fn most_recent(&self) -> Option<&str> {
        self.versions
            .iter()
            .max_by(|(va, a), (vb, b)| {
                a.installed_at
                    .cmp(&b.installed_at)
                    .then_with(|| compare_versions(va, vb))
            })
            .map(|(v, _)| v.as_str())
    }

    /// Installed versions, newest first.
    pub fn installed_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.versions.keys().cloned().collect();
        crate::core::version_cmp::sort_newest_first(&mut versions);
        versions
    }

    /// Bring a record read from disk into the multi-version shape.
    ///
    /// Returns false if nothing usable is left and the entry should be dropped.
    fn migrate(&mut self) -> bool {
        if let Some(version) = self.version.take()
            && !version.is_empty()
            && !self.versions.contains_key(&version)
        {
            let state = VersionState {
                requested: version.clone(),
                binaries: std::mem::take(&mut self.binaries),
                installed_at: epoch(),
            };
            self.versions.insert(version.clone(), state);
            if self.active_version.is_empty() {
                self.active_version = version;
            }
        }
        self.binaries.clear();

        if self.versions.is_empty() {
            return false;
        }
        if !self.versions.contains_key(&self.active_version) {
            self.active_version = self.most_recent().unwrap_or_default().to_string();
        }
        true
    }

    fn is_consistent(&self) -> bool {
        !self.versions.is_empty() && self.versions.contains_key(&self.active_version)
    }
}

/// What a version-scoped removal did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub removed: VersionState,
    /// The active version afterwards, `None` when the tool entry is gone.
    pub active_version: Option<String>,
    /// The active version changed.
    pub reactivated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub installed: BTreeMap<String, ToolState>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            installed: BTreeMap::new(),
        }
    }
}

impl State {
    pub fn get(&self, tool: &str) -> Option<&ToolState> {
        self.installed.get(tool)
    }

    fn tool_mut(&mut self, tool: &str) -> Result<&mut ToolState, StateError> {
        self.installed
            .get_mut(tool)
            .ok_or_else(|| StateError::ToolNotInstalled {
                tool: tool.to_string(),
            })
    }

    /// Record a successful install and make it active.
    ///
    /// Returns the previously active version, if any.
    pub fn record_install(
        &mut self,
        tool: &str,
        version: &str,
        entry: VersionState,
        dependencies: &ResolvedDependencySet,
        explicit: bool,
    ) -> Result<Option<String>, StateError> {
        check_version(version)?;
        let previous = match self.installed.get_mut(tool) {
            Some(existing) => {
                let previous = existing.active_version.clone();
                existing.add_version(version, entry, true);
                existing.is_explicit |= explicit;
                Some(previous)
            }
            None => {
                let mut created = ToolState::new(version, entry);
                created.is_explicit = explicit;
                self.installed.insert(tool.to_string(), created);
                None
            }
        };

        if let Some(record) = self.installed.get_mut(tool) {
            record.install_dependencies = dependencies.install_time.clone();
            record.runtime_dependencies = dependencies.runtime.clone();
        }
        Ok(previous)
    }

    /// Note that `tool` depends on `dependency`.
    pub fn add_required_by(&mut self, dependency: &str, tool: &str) {
        if let Some(record) = self.installed.get_mut(dependency) {
            record.required_by.insert(tool.to_string());
        }
    }

    /// Switch the active version of an installed tool.
    pub fn activate(&mut self, tool: &str, version: &str) -> Result<&ToolState, StateError> {
        check_version(version)?;
        let record = self.tool_mut(tool)?;
        if !record.activate(version) {
            return Err(StateError::VersionNotInstalled {
                tool: tool.to_string(),
                version: version.to_string(),
                installed: record.installed_versions(),
            });
        }
        Ok(record)
    }

    /// Put back the entry a reinstall of `version` overwrote.
    pub fn restore_version(
        &mut self,
        tool: &str,
        version: &str,
        entry: VersionState,
    ) -> Result<(), StateError> {
        check_version(version)?;
        self.tool_mut(tool)?.add_version(version, entry, false);
        Ok(())
    }

    /// Remove one version. Removing the last version removes the tool.
    pub fn remove_version(&mut self, tool: &str, version: &str) -> Result<Removal, StateError> {
        check_version(version)?;
        let record = self.tool_mut(tool)?;
        let previous_active = record.active_version.clone();
        let Some(removed) = record.remove_version(version) else {
            return Err(StateError::VersionNotInstalled {
                tool: tool.to_string(),
                version: version.to_string(),
                installed: record.installed_versions(),
            });
        };

        if record.is_empty() {
            self.remove_tool(tool)?;
            return Ok(Removal {
                removed,
                active_version: None,
                reactivated: false,
            });
        }
        let active = record.active_version.clone();
        Ok(Removal {
            removed,
            reactivated: active != previous_active,
            active_version: Some(active),
        })
    }

    /// Remove a tool with all its versions.
    pub fn remove_tool(&mut self, tool: &str) -> Result<ToolState, StateError> {
        let removed = self
            .installed
            .remove(tool)
            .ok_or_else(|| StateError::ToolNotInstalled {
                tool: tool.to_string(),
            })?;
        for record in self.installed.values_mut() {
            record.required_by.remove(tool);
        }
        Ok(removed)
    }

    /// Migrate legacy records in place. Returns how many entries changed.
    pub fn migrate(&mut self) -> usize {
        let before = self.clone();
        self.installed.retain(|name, record| {
            let keep = record.migrate();
            if !keep {
                tracing::warn!(tool = %name, "dropping empty state record");
            }
            keep
        });
        self.schema_version = SCHEMA_VERSION;

        before
            .installed
            .iter()
            .filter(|(name, old)| self.installed.get(*name) != Some(*old))
            .count()
    }

    /// Every entry satisfies the state invariants.
    pub fn is_consistent(&self) -> bool {
        self.installed.values().all(ToolState::is_consistent)
    }
}

/// Locked access to `state.json`.
#[derive(Debug, Clone)]
pub struct StateManager {
    path: PathBuf,
    lock_path: PathBuf,
    timeout: Duration,
}

impl StateManager {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.state_path(), config.lock_timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn lock(&self, mode: LockMode) -> Result<FileLock, StateError> {
        FileLock::acquire(&self.lock_path, mode, self.timeout).map_err(|err| match err {
            LockError::Timeout { waited } => StateError::StateLocked {
                path: self.lock_path.clone(),
                waited,
            },
            LockError::Io(source) => StateError::Io {
                path: self.lock_path.clone(),
                source,
            },
        })
    }

    /// Read the state under a shared lock.
    pub fn load(&self) -> Result<State, StateError> {
        let _guard = self.lock(LockMode::Shared)?;
        self.read_unlocked()
    }

    /// Locked read-modify-write. Nothing is written if `f` fails.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut State) -> Result<T, E>,
        E: From<StateError>,
    {
        let _guard = self.lock(LockMode::Exclusive)?;
        let mut state = self.read_unlocked()?;
        let value = f(&mut state)?;
        self.write_unlocked(&state)?;
        Ok(value)
    }

    fn read_unlocked(&self) -> Result<State, StateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(State::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let mut state: State =
            serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        let schema = state.schema_version;
        let migrated = state.migrate();
        if migrated > 0 || schema < SCHEMA_VERSION {
            tracing::info!(
                path = %self.path.display(),
                from_schema = schema,
                migrated,
                "migrated state file"
            );
        }
        Ok(state)
    }

    fn write_unlocked(&self, state: &State) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(io_err)?;

        let json = serde_json::to_string_pretty(state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        tracing::debug!(path = %self.path.display(), tools = state.installed.len(), "wrote state");
        Ok(())
    }
}
