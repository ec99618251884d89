//! `chmod` and `install_binaries` actions

use super::{ActionHandler, ExecutionContext, StepOutput, optional_str, string_list};
use crate::plan::PlanStep;
use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};

const DEFAULT_MODE: u32 = 0o755;

/// Parse an octal mode such as `755` or `0o644`.
pub fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    let value =
        u32::from_str_radix(digits, 8).map_err(|_| anyhow!("invalid octal mode '{}'", mode))?;
    if value > 0o7777 {
        bail!("mode '{}' is out of range", mode);
    }
    Ok(value)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {} failed", mode, path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

pub struct Chmod;

impl ActionHandler for Chmod {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        let files = string_list(step, "files")?;
        let mode = match optional_str(step, "mode")? {
            Some(m) => parse_mode(m)?,
            None => DEFAULT_MODE,
        };

        let mut out = StepOutput::default();
        for file in files {
            let path = ctx.install_path(&file);
            if !path.exists() {
                bail!("chmod: {} does not exist", path.display());
            }
            set_mode(&path, mode)?;
            out.files.push(path);
        }
        Ok(out)
    }
}

/// One `src` or `src:dest-name` entry of `install_binaries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinarySpec {
    pub src: String,
    pub name: String,
}

impl BinarySpec {
    pub fn parse(entry: &str) -> Result<Self> {
        let (src, name) = match entry.split_once(':') {
            Some((src, name)) => (src.trim(), name.trim().to_string()),
            None => {
                let src = entry.trim();
                let name = Path::new(src)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (src, name)
            }
        };
        if src.is_empty() || name.is_empty() {
            bail!("invalid binary entry '{}'", entry);
        }
        if name.contains('/') || name == "." || name == ".." {
            bail!("binary name '{}' must be a plain file name", name);
        }
        Ok(Self {
            src: src.to_string(),
            name,
        })
    }
}

pub struct InstallBinaries;

impl InstallBinaries {
    /// Look in the install directory first, then the work directory.
    fn locate(ctx: &ExecutionContext, src: &str) -> Option<PathBuf> {
        let candidates = [ctx.install_path(src), ctx.work_path(src)];
        candidates.into_iter().find(|p| p.is_file())
    }
}

impl ActionHandler for InstallBinaries {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        let bin_dir = ctx.install_dir.join("bin");
        std::fs::create_dir_all(&bin_dir)
            .with_context(|| format!("cannot create {}", bin_dir.display()))?;

        let mut out = StepOutput::default();
        for entry in string_list(step, "binaries")? {
            let spec = BinarySpec::parse(&entry)?;
            let src = Self::locate(ctx, &spec.src).ok_or_else(|| {
                anyhow!(
                    "binary '{}' not found in {} or {}",
                    spec.src,
                    ctx.install_dir.display(),
                    ctx.work_dir.display()
                )
            })?;
            let dest = bin_dir.join(&spec.name);
            if src != dest {
                std::fs::copy(&src, &dest).with_context(|| {
                    format!("cannot copy {} to {}", src.display(), dest.display())
                })?;
            }
            set_mode(&dest, DEFAULT_MODE)?;
            tracing::debug!(binary = %spec.name, src = %src.display(), "installed binary");

            out.binaries.push(format!("bin/{}", spec.name));
            out.files.push(dest);
        }
        Ok(out)
    }
}
