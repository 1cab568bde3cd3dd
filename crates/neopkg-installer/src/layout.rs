use std::path::{Path, PathBuf};

use neopkg_core::ArchiveType;

pub const CURRENT_LINK_NAME: &str = "current";
pub const STORAGE_DIR_NAME: &str = "storage";
pub const ENV_FILE_NAME: &str = ".env";

/// Paths under `dist_dir`:
///
/// ```text
/// <root>/<name>/<version>/          extracted tree
/// <root>/<name>/<version><ext>      downloaded archive
/// <root>/<name>/current -> <version>
/// <root>/<name>/storage/.env
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistLayout {
    root: PathBuf,
}

impl DistLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.package_dir(name).join(version)
    }

    pub fn archive_path(&self, name: &str, version: &str, archive_type: ArchiveType) -> PathBuf {
        self.package_dir(name)
            .join(format!("{version}{}", archive_type.file_extension()))
    }

    pub fn current_link(&self, name: &str) -> PathBuf {
        self.package_dir(name).join(CURRENT_LINK_NAME)
    }

    pub fn storage_dir(&self, name: &str) -> PathBuf {
        self.package_dir(name).join(STORAGE_DIR_NAME)
    }

    pub fn env_file(&self, name: &str) -> PathBuf {
        self.storage_dir(name).join(ENV_FILE_NAME)
    }
}
