use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::DistLayout;

/// The version the `current` link selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentVersion {
    /// Last component of the link target, i.e. the version directory name.
    pub version: String,
    pub link: PathBuf,
    pub target_dir: PathBuf,
}

/// Resolves `<name>/current`. A missing link, or one whose target directory
/// is gone, reads as "not installed".
pub fn read_current(layout: &DistLayout, name: &str) -> Result<Option<CurrentVersion>> {
    let link = layout.current_link(name);
    let target = match fs::read_link(&link) {
        Ok(target) => target,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read link {}", link.display()))
        }
    };

    let Some(version) = target.file_name().map(|v| v.to_string_lossy().to_string()) else {
        return Ok(None);
    };
    let target_dir = if target.is_absolute() {
        target
    } else {
        layout.package_dir(name).join(target)
    };
    if !target_dir.is_dir() {
        debug!(package = name, link = %link.display(), "current link points to a missing directory");
        return Ok(None);
    }

    Ok(Some(CurrentVersion {
        version,
        link,
        target_dir,
    }))
}

/// Points `<name>/current` at `<version>` with a relative link, replacing any
/// previous link. The version directory must already be fully populated.
pub fn publish_current(layout: &DistLayout, name: &str, version: &str) -> Result<PathBuf> {
    let version_dir = layout.version_dir(name, version);
    if !version_dir.is_dir() {
        anyhow::bail!(
            "cannot publish missing version directory {}",
            version_dir.display()
        );
    }

    let link = layout.current_link(name);
    remove_link(&link)?;
    create_dir_link(Path::new(version), &link)?;
    Ok(link)
}

pub(crate) fn remove_link(link: &Path) -> Result<()> {
    let Ok(metadata) = fs::symlink_metadata(link) else {
        return Ok(());
    };
    if !metadata.file_type().is_symlink() {
        anyhow::bail!("{} exists and is not a symlink", link.display());
    }

    #[cfg(windows)]
    {
        fs::remove_dir(link)
            .or_else(|_| fs::remove_file(link))
            .with_context(|| format!("failed to remove link {}", link.display()))
    }

    #[cfg(not(windows))]
    {
        fs::remove_file(link).with_context(|| format!("failed to remove link {}", link.display()))
    }
}

fn create_dir_link(target: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    let created = std::os::unix::fs::symlink(target, link);
    #[cfg(windows)]
    let created = std::os::windows::fs::symlink_dir(target, link);

    created.with_context(|| {
        format!(
            "failed to create symlink {} -> {}",
            link.display(),
            target.display()
        )
    })
}
