//! Atomic activation
//!
//! `tools/current/<name>` points at the active `tools/<name>-<version>`, and
//! every exposed binary is linked from `bin/` through that indirection:
//!
//! ```text
//! bin/rg -> ../tools/current/ripgrep/bin/rg
//! tools/current/ripgrep -> ../ripgrep-14.1.0
//! ```
//!
//! Switching versions therefore only swaps one link. Each link is created
//! under a temporary name and renamed over the old one, so readers see the
//! old or the new target, never a missing link.

use crate::core::config::Config;
use crate::error::StateError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Name of the link in `bin/` for a binary path such as `bin/rg`.
pub fn link_name(binary: &str) -> Option<&str> {
    Path::new(binary)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
}

/// Target of the `bin/` link for `binary` of `tool`.
pub fn bin_link_target(tool: &str, binary: &str) -> PathBuf {
    Path::new("..")
        .join("tools")
        .join("current")
        .join(tool)
        .join(binary.trim_start_matches('/'))
}

/// Replace whatever is at `link` with a symlink to `target`.
#[cfg(unix)]
pub fn swap_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let parent = link
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "link has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let file_name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{}.tmp-{}-{}",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    std::os::unix::fs::symlink(target, &tmp)?;
    if let Err(e) = std::fs::rename(&tmp, link) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn swap_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlink activation requires a unix platform",
    ))
}

/// Remove `link` if it is a symlink. Other files are left alone.
fn remove_link(link: &Path) -> io::Result<bool> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(link)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether the `bin/` link at `link` belongs to `tool`.
fn owned_by(link: &Path, tool: &str) -> bool {
    let owner = Path::new("..").join("tools").join("current").join(tool);
    std::fs::read_link(link).is_ok_and(|target| target.starts_with(&owner))
}

/// Make `version` the active version of `tool` on disk.
///
/// `binaries` are the new version's binaries; `previous` are the ones the
/// old active version exposed. Links for binaries the new version no longer
/// ships are removed.
pub fn activate(
    config: &Config,
    tool: &str,
    version: &str,
    binaries: &[String],
    previous: &[String],
) -> Result<(), StateError> {
    let tool_dir = config.tool_dir(tool, version);
    if !tool_dir.is_dir() {
        return Err(StateError::Io {
            path: tool_dir,
            source: io::Error::new(io::ErrorKind::NotFound, "version directory is missing"),
        });
    }

    let current = config.current_link(tool);
    let relative = Path::new("..").join(format!("{}-{}", tool, version));
    swap_symlink(&relative, &current).map_err(io_error(&current))?;

    let bin_dir = config.bin_dir();
    let mut linked = Vec::new();
    for binary in binaries {
        let Some(name) = link_name(binary) else {
            tracing::warn!(tool, binary = %binary, "skipping binary without a file name");
            continue;
        };
        let link = bin_dir.join(name);
        if std::fs::symlink_metadata(&link).is_ok() && !owned_by(&link, tool) {
            tracing::warn!(tool, link = %link.display(), "replacing binary link owned by another tool");
        }
        swap_symlink(&bin_link_target(tool, binary), &link).map_err(io_error(&link))?;
        linked.push(name.to_string());
    }

    for binary in previous {
        let Some(name) = link_name(binary) else {
            continue;
        };
        if linked.iter().any(|l| l == name) {
            continue;
        }
        let link = bin_dir.join(name);
        if owned_by(&link, tool) {
            remove_link(&link).map_err(io_error(&link))?;
        }
    }

    tracing::info!(tool, version, binaries = linked.len(), "activated");
    Ok(())
}

/// Remove the current link and every `bin/` link owned by `tool`.
pub fn deactivate(config: &Config, tool: &str, binaries: &[String]) -> Result<(), StateError> {
    let bin_dir = config.bin_dir();
    for binary in binaries {
        if let Some(name) = link_name(binary) {
            let link = bin_dir.join(name);
            if owned_by(&link, tool) {
                remove_link(&link).map_err(io_error(&link))?;
            }
        }
    }
    let current = config.current_link(tool);
    remove_link(&current).map_err(io_error(&current))?;
    Ok(())
}
