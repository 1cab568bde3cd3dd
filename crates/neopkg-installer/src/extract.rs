use std::ffi::OsString;
use std::fs;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use neopkg_core::{ArchiveType, PkgError};
use tar::EntryType;

/// Unpacks `archive_path` into `dst`. Tarballs drop the first
/// `strip_components` path components of every entry; zip archives are
/// unpacked as-is. Existing files are overwritten.
pub fn extract_archive(
    archive_type: ArchiveType,
    archive_path: &Path,
    dst: &Path,
    strip_components: usize,
) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    match archive_type {
        ArchiveType::TarGz => extract_tar_gz(archive_path, dst, strip_components),
        ArchiveType::Zip => extract_zip(archive_path, dst),
    }
}

/// [`extract_archive`] on the blocking pool.
pub async fn extract_archive_blocking(
    archive_type: ArchiveType,
    archive_path: PathBuf,
    dst: PathBuf,
    strip_components: usize,
) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        extract_archive(archive_type, &archive_path, &dst, strip_components)
    })
    .await
    .context("archive extraction task failed")?
}

fn extract_tar_gz(archive_path: &Path, dst: &Path, strip_components: usize) -> Result<()> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    let root = fs::canonicalize(dst).with_context(|| format!("failed to resolve {}", dst.display()))?;

    let mut extracted_any = false;
    for entry in archive
        .entries()
        .with_context(|| format!("failed to read tar archive {}", archive_path.display()))?
    {
        let mut entry = entry
            .with_context(|| format!("failed to read entry of {}", archive_path.display()))?;
        let entry_path = entry.path().context("tar entry has an invalid path")?.into_owned();
        ensure_safe_entry_path(&entry_path)?;
        let Some(rel) = strip_rel_components(&entry_path, strip_components) else {
            continue;
        };
        let dst_path = dst.join(&rel);
        if let Some(parent) = dst_path.parent() {
            ensure_inside(&root, parent, &rel)?;
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if entry.header().entry_type() == EntryType::Symlink {
            let target = entry
                .link_name()
                .context("tar symlink entry has an invalid target")?
                .ok_or_else(|| anyhow!("tar symlink entry '{}' has no target", rel.display()))?
                .into_owned();
            ensure_link_target_inside(&rel, &target)?;
        }

        if entry.header().entry_type() == EntryType::Link {
            let link_name = entry
                .link_name()
                .context("tar hard link entry has an invalid target")?
                .ok_or_else(|| anyhow!("tar hard link entry '{}' has no target", rel.display()))?
                .into_owned();
            ensure_safe_entry_path(&link_name)?;
            let Some(link_rel) = strip_rel_components(&link_name, strip_components) else {
                continue;
            };
            let _ = fs::remove_file(&dst_path);
            fs::hard_link(dst.join(&link_rel), &dst_path).with_context(|| {
                format!("failed to create hard link {}", dst_path.display())
            })?;
        } else {
            entry
                .unpack(&dst_path)
                .with_context(|| format!("failed to unpack {}", dst_path.display()))?;
        }
        extracted_any = true;
    }

    if !extracted_any {
        return Err(anyhow!(
            "no files extracted from {}; strip_components={} may be too large",
            archive_path.display(),
            strip_components
        ));
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dst: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("failed to read zip archive {}", archive_path.display()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read entry {index} of {}", archive_path.display()))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(anyhow!("unsafe zip entry path '{}'", entry.name()));
        };
        let dst_path = dst.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&dst_path)
                .with_context(|| format!("failed to create {}", dst_path.display()))?;
            continue;
        }

        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = fs::File::create(&dst_path)
            .with_context(|| format!("failed to create {}", dst_path.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to write {}", dst_path.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dst_path, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("failed to set mode on {}", dst_path.display()))?;
        }
    }
    Ok(())
}

fn ensure_safe_entry_path(path: &Path) -> Result<()> {
    let unsafe_component = path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if unsafe_component {
        return Err(anyhow!("unsafe archive entry path '{}'", path.display()));
    }
    Ok(())
}

/// Fails when the deepest existing ancestor of `path` resolves outside
/// `root`, i.e. when an earlier symlink would redirect the write.
fn ensure_inside(root: &Path, path: &Path, rel: &Path) -> Result<()> {
    let mut existing = path;
    while fs::symlink_metadata(existing).is_err() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let resolved = fs::canonicalize(existing)
        .with_context(|| format!("failed to resolve {}", existing.display()))?;
    if !resolved.starts_with(root) {
        return Err(PkgError::PathEscape(rel.display().to_string()).into());
    }
    Ok(())
}

/// A symlink at `rel` may only point at something below the extraction root.
fn ensure_link_target_inside(rel: &Path, target: &Path) -> Result<()> {
    let mut resolved: Vec<OsString> = rel
        .parent()
        .map(|parent| {
            parent
                .components()
                .filter_map(|component| match component {
                    Component::Normal(part) => Some(part.to_os_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    for component in target.components() {
        let escapes = match component {
            Component::Normal(part) => {
                resolved.push(part.to_os_string());
                false
            }
            Component::CurDir => false,
            Component::ParentDir => resolved.pop().is_none(),
            Component::RootDir | Component::Prefix(_) => true,
        };
        if escapes {
            return Err(PkgError::PathEscape(format!(
                "{} -> {}",
                rel.display(),
                target.display()
            ))
            .into());
        }
    }
    Ok(())
}

pub(crate) fn strip_rel_components(path: &Path, strip_components: usize) -> Option<PathBuf> {
    let components: Vec<_> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(v) => Some(v.to_os_string()),
            _ => None,
        })
        .collect();

    if components.len() <= strip_components {
        return None;
    }

    let mut out = PathBuf::new();
    for component in components.into_iter().skip(strip_components) {
        out.push(component);
    }
    Some(out)
}
