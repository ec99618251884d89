//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use toolsmith::Config;
use toolsmith::actions::registry::{ActionRegistry, ActionSpec};
use toolsmith::actions::{ExecutionContext, HandlerRegistry, StepOutput};
use toolsmith::core::platform::Target;
use toolsmith::plan::PlanStep;
use toolsmith::recipe::index::{DirSource, RecipeIndex};
use toolsmith::verify::{CommandOutput, CommandRunner};

/// An isolated toolsmith home with a recipes directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        let config = Config::new(&home).with_recipes_dir(dir.path().join("recipes"));
        config.ensure_layout().unwrap();
        std::fs::create_dir_all(config.recipes_dir()).unwrap();
        Self { dir, config }
    }

    /// Write `recipes/<name>.toml`.
    pub fn write_recipe(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config.recipes_dir().join(format!("{}.toml", name));
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Index over the recipes directory with the built-in action table.
    pub fn builtin_index(&self) -> RecipeIndex {
        RecipeIndex::new(
            DirSource::new(self.config.recipes_dir()),
            Arc::new(ActionRegistry::builtin()),
        )
    }

    /// Index over the recipes directory with [`test_registry`].
    pub fn test_index(&self) -> RecipeIndex {
        RecipeIndex::new(
            DirSource::new(self.config.recipes_dir()),
            Arc::new(test_registry()),
        )
    }
}

/// `stamp` has no implicit dependencies, `stamp_rt` needs `rt-lib` at run time.
pub fn test_registry() -> ActionRegistry {
    let mut r = ActionRegistry::new();
    r.register("stamp", ActionSpec::new().evaluable());
    r.register("stamp_rt", ActionSpec::new().runtime(&["rt-lib"]).evaluable());
    r
}

/// Writes `bin/<tool>` containing the version, plus a `message` param if set.
fn stamp(ctx: &mut ExecutionContext, step: &PlanStep) -> anyhow::Result<StepOutput> {
    let bin = ctx.install_dir.join("bin");
    std::fs::create_dir_all(&bin)?;
    let mut content = ctx.version.clone();
    if let Some(message) = step.params.get("message").and_then(|v| v.as_str()) {
        content.push('\n');
        content.push_str(message);
    }
    std::fs::write(bin.join(&ctx.tool), content)?;
    Ok(StepOutput {
        binaries: vec![format!("bin/{}", ctx.tool)],
        files: vec![],
    })
}

/// Handlers for [`test_registry`].
pub fn test_handlers() -> HandlerRegistry {
    let mut h = HandlerRegistry::new();
    h.register("stamp", stamp);
    h.register("stamp_rt", stamp);
    h
}

pub fn debian_amd64() -> Target {
    Target::new("linux", "amd64").with_family("debian")
}

/// Answers every verify command with the same output.
pub struct FixedRunner(pub String);

impl CommandRunner for FixedRunner {
    fn run(&self, _command: &str, _install_dir: &Path) -> std::io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: Some(0),
            output: self.0.clone(),
        })
    }
}

/// Read the file a `bin/` link resolves to.
pub fn read_bin(config: &Config, name: &str) -> String {
    std::fs::read_to_string(config.bin_dir().join(name)).unwrap()
}
