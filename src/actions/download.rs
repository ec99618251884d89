//! `download` action
//!
//! Parameters: `url`, optional `dest` (relative to the work directory,
//! defaults to the last URL segment) and optional `checksum`
//! (`sha256:<hex>` or bare hex).

use super::{ActionHandler, ExecutionContext, StepOutput, optional_str, required_str};
use crate::plan::PlanStep;
use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

const CHUNK_SIZE: usize = 64 * 1024;

/// HTTP timeout from `TOOLSMITH_HTTP_TIMEOUT`, read once.
fn http_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let secs = std::env::var("TOOLSMITH_HTTP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        Duration::from_secs(secs.clamp(5, 300))
    })
}

pub struct Download;

impl ActionHandler for Download {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        let url = required_str(step, "url")?;
        let dest = match optional_str(step, "dest")? {
            Some(dest) => ctx.work_path(dest),
            None => ctx.work_path(&file_name_from_url(url)?),
        };
        let checksum = optional_str(step, "checksum")?;

        fetch(url, &dest, checksum)?;
        ctx.last_download = Some(dest.clone());
        Ok(StepOutput::file(dest))
    }
}

/// Last non-empty path segment of `url`, without query or fragment.
pub fn file_name_from_url(url: &str) -> Result<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    match after_scheme.split_once('/') {
        Some((_, path)) => match path.rsplit('/').find(|s| !s.is_empty()) {
            Some(name) if name != "." && name != ".." => Ok(name.to_string()),
            _ => bail!("cannot derive a file name from URL '{}', set 'dest'", url),
        },
        None => bail!("cannot derive a file name from URL '{}', set 'dest'", url),
    }
}

/// Download `url` to `dest`, hashing while writing.
///
/// On a checksum mismatch the partial file is removed.
pub fn fetch(url: &str, dest: &Path, checksum: Option<&str>) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create directory {}", parent.display()))?;
    }

    tracing::info!(url, dest = %dest.display(), "downloading");
    let response = ureq::get(url)
        .timeout(http_timeout())
        .call()
        .map_err(|e| match e {
            ureq::Error::Status(code, _) => anyhow::anyhow!("GET {} returned HTTP {}", url, code),
            other => anyhow::anyhow!("GET {} failed: {}", url, other),
        })?;

    let mut reader = response.into_reader();
    let file =
        File::create(dest).with_context(|| format!("cannot create {}", dest.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("read error while downloading {}", url))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .with_context(|| format!("write error for {}", dest.display()))?;
        written += n as u64;
    }
    writer
        .flush()
        .with_context(|| format!("write error for {}", dest.display()))?;

    let actual = hex::encode(hasher.finalize());
    tracing::debug!(bytes = written, sha256 = %actual, "download complete");

    if let Some(expected) = checksum {
        let expected = normalize_checksum(expected)?;
        if actual != expected {
            let _ = std::fs::remove_file(dest);
            bail!(
                "SHA256 integrity check failed for '{}'\n  expected: {}\n  got:      {}",
                dest.display(),
                expected,
                actual
            );
        }
    }
    Ok(())
}

fn normalize_checksum(checksum: &str) -> Result<String> {
    let hex_part = match checksum.split_once(':') {
        Some((algo, rest)) if algo.eq_ignore_ascii_case("sha256") => rest,
        Some((algo, _)) => bail!("unsupported checksum algorithm '{}'", algo),
        None => checksum,
    };
    let hex_part = hex_part.trim().to_lowercase();
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("checksum '{}' is not a SHA256 hex digest", checksum);
    }
    Ok(hex_part)
}
