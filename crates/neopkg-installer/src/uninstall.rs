use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use neopkg_core::{ArchiveType, PkgError};
use tracing::info;

use crate::current::remove_link;
use crate::fs_utils::{remove_dir_all_if_exists, remove_file_if_exists};
use crate::{read_current, DistLayout};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedPaths {
    pub paths: Vec<PathBuf>,
}

/// Validates a cached `installed_path` before anything is deleted: it must be
/// absolute, free of `..`, and strictly inside `<dist_dir>/<name>`.
pub fn safe_installed_path(layout: &DistLayout, name: &str, installed_path: &str) -> Result<PathBuf> {
    let path = PathBuf::from(installed_path);
    let package_dir = layout.package_dir(name);
    let escapes = !path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        || !path.starts_with(layout.root())
        || !path.starts_with(&package_dir)
        || path == package_dir;
    if escapes {
        return Err(PkgError::PathEscape(installed_path.to_string()).into());
    }
    Ok(path)
}

/// Deletes an installed tree previously checked by [`safe_installed_path`].
///
/// When `path` is the `current` link, the version directory it selects, that
/// version's downloaded archive and the link itself are removed. Other
/// versions and `storage/` are left alone.
pub fn remove_installed(layout: &DistLayout, name: &str, path: &Path) -> Result<RemovedPaths> {
    let mut removed = RemovedPaths::default();
    let link = layout.current_link(name);

    if path == link {
        if let Some(current) = read_current(layout, name)? {
            let package_dir = layout.package_dir(name);
            if !current.target_dir.starts_with(&package_dir) || current.target_dir == package_dir {
                return Err(PkgError::PathEscape(current.target_dir.display().to_string()).into());
            }
            if remove_dir_all_if_exists(&current.target_dir)? {
                removed.paths.push(current.target_dir.clone());
            }
            for archive_type in [ArchiveType::TarGz, ArchiveType::Zip] {
                let archive = layout.archive_path(name, &current.version, archive_type);
                if remove_file_if_exists(&archive)? {
                    removed.paths.push(archive);
                }
            }
        }
        if fs::symlink_metadata(&link).is_ok() {
            remove_link(&link)?;
            removed.paths.push(link);
        }
    } else if path.is_dir() {
        if remove_dir_all_if_exists(path)? {
            removed.paths.push(path.to_path_buf());
        }
    } else if remove_file_if_exists(path)? {
        removed.paths.push(path.to_path_buf());
    }

    info!(package = name, removed = removed.paths.len(), "installed files removed");
    Ok(removed)
}
