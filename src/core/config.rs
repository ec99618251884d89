//! Home layout and user settings
//!
//! Everything toolsmith writes lives under one home directory:
//!
//! ```text
//! $TOOLSMITH_HOME/
//!   tools/<name>-<version>/   installed versions (read-only once committed)
//!   tools/current/<name>      active-version symlink
//!   bin/<binary>              binary links resolved through tools/current
//!   libs/                     shared libraries
//!   work/<name>-<version>/    per-install work dir (.install/ is the stage)
//!   recipes/                  default recipe directory
//!   state.json                multi-version state record
//!   config.toml               optional settings
//! ```

use super::platform::{LINUX_FAMILIES, is_known_family};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;

/// What to do when post-install verification fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyFailurePolicy {
    /// Remove the freshly installed version and restore the previous one.
    #[default]
    Rollback,
    /// Keep the install and only report the failure.
    Warn,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SettingsToml {
    lock_timeout_secs: Option<u64>,
    recipes_dir: Option<PathBuf>,
    linux_family: Option<String>,
    verify_failure: Option<VerifyFailurePolicy>,
}

/// Resolved configuration for one toolsmith home.
#[derive(Debug, Clone)]
pub struct Config {
    home: PathBuf,
    recipes_dir: PathBuf,
    pub lock_timeout: Duration,
    pub linux_family: Option<String>,
    pub verify_failure: VerifyFailurePolicy,
}

impl Config {
    /// Configuration rooted at `home` with default settings.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            recipes_dir: home.join("recipes"),
            home,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            linux_family: None,
            verify_failure: VerifyFailurePolicy::default(),
        }
    }

    /// Load configuration from the environment and `config.toml`.
    ///
    /// `TOOLSMITH_HOME` overrides the home location, then the settings file is
    /// read, then `TOOLSMITH_RECIPES` and `TOOLSMITH_LOCK_TIMEOUT` override it.
    pub fn load() -> Result<Self> {
        let home = match std::env::var_os("TOOLSMITH_HOME") {
            Some(path) => PathBuf::from(path),
            None => default_home(),
        };
        Ok(Self::load_from(home)?.with_env_overrides())
    }

    /// Apply `TOOLSMITH_RECIPES` and `TOOLSMITH_LOCK_TIMEOUT`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(recipes) = std::env::var_os("TOOLSMITH_RECIPES") {
            self.recipes_dir = PathBuf::from(recipes);
        }
        if let Some(secs) = std::env::var("TOOLSMITH_LOCK_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.lock_timeout = Duration::from_secs(secs);
        }
        self
    }

    /// Load `config.toml` from `home`, if present.
    pub fn load_from(home: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self::new(home);
        let path = config.settings_path();
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings: SettingsToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;

        if let Some(secs) = settings.lock_timeout_secs {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = settings.recipes_dir {
            config.recipes_dir = if dir.is_absolute() {
                dir
            } else {
                config.home.join(dir)
            };
        }
        if let Some(family) = &settings.linux_family
            && !is_known_family(family)
        {
            bail!(
                "Invalid linux_family '{}' in {} (expected one of: {})",
                family,
                path.display(),
                LINUX_FAMILIES.join(", ")
            );
        }
        config.linux_family = settings.linux_family;
        if let Some(policy) = settings.verify_failure {
            config.verify_failure = policy;
        }
        Ok(config)
    }

    pub fn with_recipes_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recipes_dir = dir.into();
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn recipes_dir(&self) -> &Path {
        &self.recipes_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    pub fn state_path(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.home.join("tools")
    }

    /// Install directory of one committed version.
    pub fn tool_dir(&self, name: &str, version: &str) -> PathBuf {
        self.tools_dir().join(format!("{}-{}", name, version))
    }

    pub fn current_dir(&self) -> PathBuf {
        self.tools_dir().join("current")
    }

    /// Active-version symlink for a tool.
    pub fn current_link(&self, name: &str) -> PathBuf {
        self.current_dir().join(name)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.home.join("bin")
    }

    pub fn libs_dir(&self) -> PathBuf {
        self.home.join("libs")
    }

    pub fn work_root(&self) -> PathBuf {
        self.home.join("work")
    }

    /// Work directory for one install attempt.
    pub fn work_dir(&self, name: &str, version: &str) -> PathBuf {
        self.work_root().join(format!("{}-{}", name, version))
    }

    /// Staging install directory inside the work directory.
    pub fn staging_dir(&self, name: &str, version: &str) -> PathBuf {
        self.work_dir(name, version).join(".install")
    }

    /// Create the directories every operation expects.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.home.clone(),
            self.tools_dir(),
            self.current_dir(),
            self.bin_dir(),
            self.libs_dir(),
            self.work_root(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolsmith")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let config = Config::new("/opt/ts");
        assert_eq!(config.state_path(), PathBuf::from("/opt/ts/state.json"));
        assert_eq!(
            config.tool_dir("node", "20.1.0"),
            PathBuf::from("/opt/ts/tools/node-20.1.0")
        );
        assert_eq!(
            config.current_link("node"),
            PathBuf::from("/opt/ts/tools/current/node")
        );
        assert_eq!(
            config.staging_dir("node", "20.1.0"),
            PathBuf::from("/opt/ts/work/node-20.1.0/.install")
        );
        assert_eq!(config.recipes_dir(), Path::new("/opt/ts/recipes"));
    }

    #[test]
    fn test_load_without_settings_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(dir.path()).unwrap();
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.verify_failure, VerifyFailurePolicy::Rollback);
        assert!(config.linux_family.is_none());
    }

    #[test]
    fn test_load_settings_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
lock_timeout_secs = 3
recipes_dir = "my-recipes"
linux_family = "arch"
verify_failure = "warn"
unknown_key = true
"#,
        )
        .unwrap();

        let config = Config::load_from(dir.path()).unwrap();
        assert_eq!(config.lock_timeout, Duration::from_secs(3));
        assert_eq!(config.recipes_dir(), dir.path().join("my-recipes"));
        assert_eq!(config.linux_family.as_deref(), Some("arch"));
        assert_eq!(config.verify_failure, VerifyFailurePolicy::Warn);
    }

    #[test]
    fn test_invalid_settings_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "lock_timeout_secs = \"x\"").unwrap();
        assert!(Config::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_unknown_linux_family_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "linux_family = \"ubuntu\"").unwrap();
        let err = Config::load_from(dir.path()).unwrap_err();
        assert!(err.to_string().contains("ubuntu"), "{err}");
    }

    #[test]
    fn test_ensure_layout_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("home"));
        config.ensure_layout().unwrap();
        assert!(config.current_dir().is_dir());
        assert!(config.bin_dir().is_dir());
        assert!(config.work_root().is_dir());
    }
}
