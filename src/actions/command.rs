//! Environment and shell actions: `set_env`, `run_command`, `require_command`

use super::{ActionHandler, ExecutionContext, StepOutput, optional_str, param, required_str};
use crate::plan::PlanStep;
use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

pub struct SetEnv;

impl ActionHandler for SetEnv {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        let vars = param(step, "vars")
            .context("missing required parameter 'vars'")?
            .as_string_map()
            .ok_or_else(|| anyhow!("parameter 'vars' must be a map of strings"))?;
        for (key, value) in vars {
            if key.is_empty() || key.contains('=') {
                bail!("invalid environment variable name '{}'", key);
            }
            tracing::debug!(%key, "set_env");
            ctx.env.insert(key, value);
        }
        Ok(StepOutput::default())
    }
}

pub struct RunCommand;

impl ActionHandler for RunCommand {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        let command = required_str(step, "command")?;
        let cwd = match optional_str(step, "cwd")? {
            Some(dir) => ctx.work_path(dir),
            None => ctx.work_dir.clone(),
        };
        run_shell(ctx, command, &cwd)?;
        Ok(StepOutput::default())
    }
}

/// Run `command` through `sh -c` with the install environment.
pub fn run_shell(ctx: &ExecutionContext, command: &str, cwd: &Path) -> Result<String> {
    std::fs::create_dir_all(cwd)
        .with_context(|| format!("cannot create directory {}", cwd.display()))?;

    tracing::debug!(command, cwd = %cwd.display(), "running command");
    let output = Command::new("sh")
        .args(["-c", command])
        .current_dir(cwd)
        .env("TOOLSMITH_INSTALL_DIR", &ctx.install_dir)
        .env("TOOLSMITH_WORK_DIR", &ctx.work_dir)
        .env("TOOLSMITH_LIBS_DIR", &ctx.libs_dir)
        .env("TOOLSMITH_VERSION", &ctx.version)
        .envs(&ctx.env)
        .output()
        .with_context(|| format!("command failed to start: {}", command))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        bail!(
            "command failed with exit code: {:?}\n  command: {}\n  in: {}\n{}",
            output.status.code(),
            command,
            cwd.display(),
            tail
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub struct RequireCommand;

impl ActionHandler for RequireCommand {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        let command = required_str(step, "command")?;
        let path_var = ctx
            .env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        match find_on_path(command, &path_var) {
            Some(found) => {
                tracing::debug!(command, path = %found.display(), "required command found");
                Ok(StepOutput::default())
            }
            None => bail!("required command '{}' was not found on PATH", command),
        }
    }
}

/// First executable named `command` in the `PATH`-style list `path_var`.
///
/// A command containing `/` is checked as a path instead.
pub fn find_on_path(command: &str, path_var: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let p = PathBuf::from(command);
        return is_executable(&p).then_some(p);
    }
    std::env::split_paths(path_var)
        .map(|dir| dir.join(command))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
