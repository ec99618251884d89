//! `extract` action
//!
//! Native archive extraction, no external tools. Parameters: `archive`
//! (defaults to the last download), optional `format`, `dest` (relative to
//! the install directory, defaults to it) and `strip_dirs`.
//!
//! Entries with absolute paths or `..` components are rejected, as are
//! links whose target would land outside `dest` and writes through an
//! existing symlink.

use super::{ActionHandler, ExecutionContext, StepOutput, optional_str, param};
use crate::plan::PlanStep;
use anyhow::{Context, Result, anyhow, bail};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
    Zip,
}

impl ArchiveFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim_start_matches('.').to_lowercase().as_str() {
            "tar" => Some(Self::Tar),
            "tar.gz" | "tgz" => Some(Self::TarGz),
            "tar.xz" | "txz" => Some(Self::TarXz),
            "tar.bz2" | "tbz2" => Some(Self::TarBz2),
            "tar.zst" | "tzst" => Some(Self::TarZst),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    /// Detect the format from a file name extension.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

pub struct Extract;

impl ActionHandler for Extract {
    fn execute(&self, ctx: &mut ExecutionContext, step: &PlanStep) -> Result<StepOutput> {
        let archive = match optional_str(step, "archive")? {
            Some(a) => ctx.work_path(a),
            None => ctx
                .last_download
                .clone()
                .ok_or_else(|| anyhow!("no 'archive' given and nothing was downloaded"))?,
        };
        let format = match optional_str(step, "format")? {
            Some(name) => ArchiveFormat::from_name(name)
                .ok_or_else(|| anyhow!("unsupported archive format '{}'", name))?,
            None => ArchiveFormat::detect(&archive).ok_or_else(|| {
                anyhow!(
                    "cannot detect archive format of {}, set 'format'",
                    archive.display()
                )
            })?,
        };
        let dest = match optional_str(step, "dest")? {
            Some(d) => ctx.install_path(d),
            None => ctx.install_dir.clone(),
        };
        let strip = match param(step, "strip_dirs") {
            None => 0,
            Some(v) => v
                .as_integer()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| anyhow!("'strip_dirs' must be a non-negative integer"))?,
        };

        extract(&archive, format, &dest, strip)?;
        Ok(StepOutput::file(dest))
    }
}

/// Extract `archive` into `dest`, dropping `strip` leading path components.
pub fn extract(archive: &Path, format: ArchiveFormat, dest: &Path, strip: usize) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("cannot create directory {}", dest.display()))?;
    tracing::debug!(archive = %archive.display(), dest = %dest.display(), strip, ?format, "extracting");

    let open = || -> Result<BufReader<File>> {
        let file = File::open(archive)
            .with_context(|| format!("cannot open {}", archive.display()))?;
        Ok(BufReader::new(file))
    };

    match format {
        ArchiveFormat::Tar => extract_tar(open()?, dest, strip),
        ArchiveFormat::TarGz => extract_tar(flate2::read::GzDecoder::new(open()?), dest, strip),
        ArchiveFormat::TarXz => extract_tar(xz2::read::XzDecoder::new(open()?), dest, strip),
        ArchiveFormat::TarBz2 => extract_tar(bzip2::read::BzDecoder::new(open()?), dest, strip),
        ArchiveFormat::TarZst => {
            let decoder =
                zstd::stream::read::Decoder::new(open()?).context("zstd init error")?;
            extract_tar(decoder, dest, strip)
        }
        ArchiveFormat::Zip => extract_zip(archive, dest, strip),
    }
}

/// Lexical normalisation, no filesystem access.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut has_root = false;

    for c in path.components() {
        match c {
            Component::Prefix(p) => {
                out.clear();
                out.push(p.as_os_str());
                has_root = true;
            }
            Component::RootDir => {
                out.push(Component::RootDir.as_os_str());
                has_root = true;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = out
                    .components()
                    .next_back()
                    .is_some_and(|last| matches!(last, Component::Normal(_)));
                if popped {
                    out.pop();
                } else if !has_root {
                    out.push("..");
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }

    out
}

/// Entry path with `strip` leading components removed. `None` when nothing
/// is left.
fn strip_components(path: &Path, strip: usize) -> Option<PathBuf> {
    let rest: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .skip(strip)
        .collect();
    (!rest.as_os_str().is_empty()).then_some(rest)
}

fn check_entry_path(path: &Path) -> Result<()> {
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        bail!("archive contains unsafe path: {}", path.display());
    }
    Ok(())
}

fn ensure_no_symlink_components(dest: &Path, full_path: &Path) -> Result<()> {
    let rel = full_path.strip_prefix(dest).map_err(|_| {
        anyhow!(
            "archive contains path outside destination: {}",
            full_path.display()
        )
    })?;

    let mut cur = dest.to_path_buf();
    for comp in rel.components() {
        cur.push(comp);
        if let Ok(md) = std::fs::symlink_metadata(&cur)
            && md.file_type().is_symlink()
        {
            bail!(
                "extraction blocked: symlink in path component: {}",
                cur.display()
            );
        }
    }
    Ok(())
}

fn ensure_link_target_within_dest(dest: &Path, link_parent: &Path, link_name: &Path) -> Result<()> {
    if link_name.is_absolute()
        || link_name
            .components()
            .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
    {
        bail!(
            "archive contains unsafe link target (absolute): {}",
            link_name.display()
        );
    }

    let candidate = normalize_lexical(&link_parent.join(link_name));
    if candidate.strip_prefix(normalize_lexical(dest)).is_err() {
        bail!(
            "archive contains unsafe link target (escapes dest): {} -> {}",
            link_parent.display(),
            link_name.display()
        );
    }
    Ok(())
}

fn create_parent(dest: &Path, full_path: &Path) -> Result<()> {
    if let Some(parent) = full_path.parent() {
        if parent.starts_with(dest) {
            ensure_no_symlink_components(dest, parent)?;
        }
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create directory {}", parent.display()))?;
    }
    Ok(())
}

fn extract_tar<R: Read>(reader: R, dest: &Path, strip: usize) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive.entries().context("tar read error")? {
        let mut entry = entry.context("tar entry error")?;
        let path = entry.path().context("tar path error")?.into_owned();
        check_entry_path(&path)?;

        let Some(rel) = strip_components(&path, strip) else {
            continue;
        };
        let full_path = dest.join(&rel);
        ensure_no_symlink_components(dest, &full_path)?;

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let link_name = entry
                .link_name()
                .context("tar link_name error")?
                .map(|l| l.into_owned())
                .ok_or_else(|| anyhow!("archive link without target: {}", path.display()))?;

            create_parent(dest, &full_path)?;
            if entry_type.is_symlink() {
                let link_parent = full_path.parent().unwrap_or(dest);
                ensure_link_target_within_dest(dest, link_parent, &link_name)?;
                symlink(&link_name, &full_path)?;
            } else {
                // Hard link targets are archive paths, so they strip the same way.
                check_entry_path(&link_name)?;
                let target = strip_components(&link_name, strip)
                    .map(|t| dest.join(t))
                    .ok_or_else(|| {
                        anyhow!("hard link target stripped away: {}", link_name.display())
                    })?;
                if std::fs::hard_link(&target, &full_path).is_err() {
                    std::fs::copy(&target, &full_path).with_context(|| {
                        format!("cannot link {} -> {}", full_path.display(), target.display())
                    })?;
                }
            }
            continue;
        }

        create_parent(dest, &full_path)?;
        entry
            .unpack(&full_path)
            .with_context(|| format!("unpack error for {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    if std::fs::symlink_metadata(link).is_ok() {
        std::fs::remove_file(link)
            .with_context(|| format!("cannot replace {}", link.display()))?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("cannot create symlink {}", link.display()))
}

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> Result<()> {
    bail!("symlinks are not supported on this platform: {}", link.display())
}

fn extract_zip(archive_path: &Path, dest: &Path, strip: usize) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("cannot open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("zip read error")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry error")?;
        let Some(name) = file.enclosed_name() else {
            bail!("archive contains unsafe path: {}", file.name());
        };
        let Some(rel) = strip_components(&name, strip) else {
            continue;
        };
        let outpath = dest.join(rel);
        ensure_no_symlink_components(dest, &outpath)?;

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)
                .with_context(|| format!("cannot create directory {}", outpath.display()))?;
            continue;
        }

        create_parent(dest, &outpath)?;
        let mut outfile = File::create(&outpath)
            .with_context(|| format!("cannot create {}", outpath.display()))?;
        std::io::copy(&mut file, &mut outfile)
            .with_context(|| format!("write error for {}", outpath.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o7777))
                    .with_context(|| format!("cannot set permissions on {}", outpath.display()))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{test_context, test_step};
    use crate::recipe::params::ParamValue;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let enc = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn tar_with_symlink(path: &Path, link: &str, target: &str) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, link, target).unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn test_detect_format() {
        let d = |p: &str| ArchiveFormat::detect(Path::new(p));
        assert_eq!(d("a.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(d("a.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(d("a.tar.xz"), Some(ArchiveFormat::TarXz));
        assert_eq!(d("a.tbz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(d("a.tar.zst"), Some(ArchiveFormat::TarZst));
        assert_eq!(d("a.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(d("a.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(d("a.rpm"), None);
        assert_eq!(ArchiveFormat::from_name(".tar.gz"), Some(ArchiveFormat::TarGz));
    }

    #[test]
    fn test_strip_components() {
        assert_eq!(
            strip_components(Path::new("tool-1.0/bin/tool"), 1),
            Some(PathBuf::from("bin/tool"))
        );
        assert_eq!(strip_components(Path::new("./tool-1.0/"), 1), None);
        assert_eq!(
            strip_components(Path::new("a/b"), 0),
            Some(PathBuf::from("a/b"))
        );
    }

    #[test]
    fn test_extract_tar_gz_with_strip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("tool.tar.gz");
        tar_gz(
            &archive,
            &[
                ("tool-1.0/bin/tool", b"#!/bin/sh\necho hi\n"),
                ("tool-1.0/README", b"readme"),
            ],
        );

        let dest = dir.path().join("out");
        extract(&archive, ArchiveFormat::TarGz, &dest, 1).unwrap();
        assert!(dest.join("bin/tool").is_file());
        assert_eq!(std::fs::read_to_string(dest.join("README")).unwrap(), "readme");
        assert!(!dest.join("tool-1.0").exists());
    }

    #[test]
    fn test_extract_handler_uses_last_download() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(dir.path());
        let archive = ctx.work_dir.join("tool.tar.gz");
        tar_gz(&archive, &[("bin/tool", b"x")]);
        ctx.last_download = Some(archive);

        let out = Extract
            .execute(&mut ctx, &test_step("extract", &[]))
            .unwrap();
        assert_eq!(out.files, vec![ctx.install_dir.clone()]);
        assert!(ctx.install_dir.join("bin/tool").is_file());
    }

    #[test]
    fn test_extract_handler_requires_archive() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(dir.path());
        let err = Extract
            .execute(&mut ctx, &test_step("extract", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("nothing was downloaded"));
    }

    #[test]
    fn test_extract_handler_rejects_bad_strip() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(dir.path());
        let step = test_step(
            "extract",
            &[
                ("archive", ParamValue::String("a.tar".into())),
                ("strip_dirs", ParamValue::Integer(-1)),
            ],
        );
        assert!(Extract.execute(&mut ctx, &step).is_err());
    }

    #[test]
    fn test_rejects_parent_dir_entry() {
        // tar::Builder refuses `..`, so write the raw header name.
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.tar");
        {
            let file = File::create(&archive).unwrap();
            let mut builder = tar::Builder::new(file);
            let mut header = tar::Header::new_gnu();
            let name = b"../escape";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_size(1);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &b"x"[..]).unwrap();
            builder.finish().unwrap();
        }

        let dest = dir.path().join("out");
        let err = extract(&archive, ArchiveFormat::Tar, &dest, 0).unwrap_err();
        assert!(err.to_string().contains("unsafe path"));
        assert!(!dir.path().join("escape").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_escaping_symlink() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("link.tar");
        tar_with_symlink(&archive, "evil", "../../etc/passwd");

        let dest = dir.path().join("out");
        let err = extract(&archive, ArchiveFormat::Tar, &dest, 0).unwrap_err();
        assert!(err.to_string().contains("escapes dest"));
    }

    #[cfg(unix)]
    #[test]
    fn test_allows_internal_symlink() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("link.tar");
        tar_with_symlink(&archive, "bin/tool", "../libexec/tool");

        let dest = dir.path().join("out");
        extract(&archive, ArchiveFormat::Tar, &dest, 0).unwrap();
        let meta = std::fs::symlink_metadata(dest.join("bin/tool")).unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[test]
    fn test_extract_zip_with_strip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("tool.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
            zip.start_file("tool-1.0/bin/tool", options).unwrap();
            zip.write_all(b"binary").unwrap();
            zip.finish().unwrap();
        }

        let dest = dir.path().join("out");
        extract(&archive, ArchiveFormat::Zip, &dest, 1).unwrap();
        assert_eq!(std::fs::read(dest.join("bin/tool")).unwrap(), b"binary");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dest.join("bin/tool"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
