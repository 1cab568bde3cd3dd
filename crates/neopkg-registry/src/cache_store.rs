use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use neopkg_core::{validate_package_name, PackageCache};

use crate::fs_ops::write_file_replacing;

const CACHE_FILE_NAME: &str = "cache.yml";

/// Per-roster store of `<root>/<name>/cache.yml` files.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(CACHE_FILE_NAME)
    }

    /// Returns `Ok(None)` when no cache has been written for `name` yet.
    pub fn read_cache(&self, name: &str) -> Result<Option<PackageCache>> {
        validate_package_name(name)?;
        let path = self.cache_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading package cache: {}", path.display()))
            }
        };

        let cache = PackageCache::from_yaml_str(&content)
            .with_context(|| format!("failed parsing package cache: {}", path.display()))?;
        Ok(Some(cache))
    }

    pub fn write_cache(&self, cache: &PackageCache) -> Result<()> {
        validate_package_name(&cache.name)?;
        let path = self.cache_path(&cache.name);
        let content = cache.to_yaml_string()?;
        write_file_replacing(&path, content.as_bytes())
            .with_context(|| format!("failed writing package cache: {}", path.display()))
    }

    /// Names of every package with a cache file, sorted.
    pub fn cache_names(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed reading cache root: {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_package_name(&name).is_ok() && entry.path().join(CACHE_FILE_NAME).is_file()
            {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    /// Visits every readable cache entry; the callback returns `false` to stop.
    pub fn walk_caches<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(PackageCache) -> bool,
    {
        for name in self.cache_names()? {
            let Some(cache) = self.read_cache(&name)? else {
                continue;
            };
            if !cb(cache) {
                break;
            }
        }
        Ok(())
    }
}
