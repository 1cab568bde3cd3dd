use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use neopkg_core::{validate_package_name, PackageMeta};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::fs_ops::is_empty_dir;
use crate::{
    git_head_snapshot_id, run_git_clone, run_git_command, unique_suffix, CacheStore,
    RosterSource, RosterSyncResult, RosterSyncStatus,
};

const PROJECTS_DIR: &str = "projects";
const META_FILE_NAMES: [&str; 2] = ["package.yml", "package.yaml"];

/// Local mirror of every configured roster under `meta_dir`.
///
/// Rosters are ordered: when the same package name exists in more than one
/// roster, the first roster wins.
#[derive(Debug)]
pub struct Catalog {
    meta_dir: PathBuf,
    rosters: Vec<RosterSource>,
    cache_stores: BTreeMap<String, CacheStore>,
    sync_lock: Mutex<()>,
}

impl Catalog {
    pub fn new(meta_dir: impl AsRef<Path>, rosters: Vec<RosterSource>) -> Result<Self> {
        if rosters.is_empty() {
            anyhow::bail!("at least one roster must be configured");
        }

        let meta_dir = absolutize(meta_dir.as_ref())?;
        let mut cache_stores = BTreeMap::new();
        for roster in &rosters {
            validate_package_name(&roster.name)
                .with_context(|| format!("invalid roster name '{}'", roster.name))?;
            let cache_dir = meta_dir.join(".cache").join(&roster.name);
            fs::create_dir_all(&cache_dir).with_context(|| {
                format!("failed creating cache directory {}", cache_dir.display())
            })?;
            if cache_stores
                .insert(roster.name.clone(), CacheStore::new(cache_dir))
                .is_some()
            {
                anyhow::bail!("roster '{}' is configured twice", roster.name);
            }
        }

        Ok(Self {
            meta_dir,
            rosters,
            cache_stores,
            sync_lock: Mutex::new(()),
        })
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    pub fn rosters(&self) -> &[RosterSource] {
        &self.rosters
    }

    pub fn roster_dir(&self, roster: &str) -> PathBuf {
        self.meta_dir.join(roster)
    }

    pub fn cache_store(&self, roster: &str) -> Option<&CacheStore> {
        self.cache_stores.get(roster)
    }

    /// Cache store of the highest-precedence roster.
    pub fn primary_cache_store(&self) -> &CacheStore {
        &self.cache_stores[&self.rosters[0].name]
    }

    /// Clones or force-updates every roster in order; stops at the first failure.
    pub async fn sync(&self) -> Result<Vec<RosterSyncResult>> {
        let mut results = Vec::with_capacity(self.rosters.len());
        for roster in &self.rosters {
            results.push(self.sync_roster(roster).await?);
        }
        Ok(results)
    }

    pub async fn sync_roster(&self, roster: &RosterSource) -> Result<RosterSyncResult> {
        let _guard = self.sync_lock.lock().await;
        let destination = self.roster_dir(&roster.name);

        if destination.join(".git").exists() {
            let before = git_head_snapshot_id(&destination, &roster.name).await.ok();

            run_git_command(&destination, &["reset", "--hard"], &roster.name).await?;
            run_git_command(
                &destination,
                &[
                    "fetch",
                    "--depth",
                    "1",
                    "--force",
                    "--",
                    roster.url.as_str(),
                    roster.branch.as_str(),
                ],
                &roster.name,
            )
            .await?;
            run_git_command(&destination, &["reset", "--hard", "FETCH_HEAD"], &roster.name)
                .await?;
            run_git_command(&destination, &["clean", "-ffdx"], &roster.name).await?;

            let snapshot_id = git_head_snapshot_id(&destination, &roster.name).await?;
            let status = if before.as_deref() == Some(snapshot_id.as_str()) {
                RosterSyncStatus::UpToDate
            } else {
                RosterSyncStatus::Updated
            };
            info!(roster = %roster.name, %snapshot_id, ?status, "roster synced");
            return Ok(RosterSyncResult {
                roster: roster.name.clone(),
                status,
                snapshot_id,
            });
        }

        if destination.exists() && !is_empty_dir(&destination)? {
            anyhow::bail!(
                "roster-sync-failed: roster '{}' directory {} exists but is not a git checkout",
                roster.name,
                destination.display()
            );
        }

        let staged = self
            .meta_dir
            .join(format!(".tmp-{}-{}", roster.name, unique_suffix()));
        let cloned = async {
            run_git_clone(&roster.url, &roster.branch, &staged, &roster.name).await?;
            let snapshot_id = git_head_snapshot_id(&staged, &roster.name).await?;
            if destination.exists() {
                fs::remove_dir(&destination).with_context(|| {
                    format!("failed removing empty directory {}", destination.display())
                })?;
            }
            fs::rename(&staged, &destination).with_context(|| {
                format!(
                    "roster-sync-failed: roster '{}' failed moving clone into {}",
                    roster.name,
                    destination.display()
                )
            })?;
            Ok::<_, anyhow::Error>(snapshot_id)
        }
        .await;

        match cloned {
            Ok(snapshot_id) => {
                info!(roster = %roster.name, %snapshot_id, "roster cloned");
                Ok(RosterSyncResult {
                    roster: roster.name.clone(),
                    status: RosterSyncStatus::Cloned,
                    snapshot_id,
                })
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&staged);
                Err(err)
            }
        }
    }

    /// Visits every package directory of one roster; the callback returns
    /// `false` to stop.
    pub fn walk_roster_packages<F>(&self, roster: &str, mut cb: F) -> Result<()>
    where
        F: FnMut(&str) -> bool,
    {
        let projects = self.roster_dir(roster).join(PROJECTS_DIR);
        let mut names = Vec::new();
        for entry in fs::read_dir(&projects)
            .with_context(|| format!("failed reading roster projects: {}", projects.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();

        for name in names {
            if !cb(&name) {
                break;
            }
        }
        Ok(())
    }

    /// Visits `(roster, package)` pairs across all synced rosters in
    /// precedence order. Rosters that were never synced are skipped.
    pub fn walk_packages<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        for roster in &self.rosters {
            if !self.roster_dir(&roster.name).join(PROJECTS_DIR).is_dir() {
                debug!(roster = %roster.name, "roster not synced yet, skipping walk");
                continue;
            }
            let mut keep_going = true;
            self.walk_roster_packages(&roster.name, |name| {
                keep_going = cb(&roster.name, name);
                keep_going
            })?;
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Loads `package.yml` (or `package.yaml`) from the first roster that has it.
    /// Returns `Ok(None)` when no roster knows the package.
    pub fn load_package_meta(&self, name: &str) -> Result<Option<PackageMeta>> {
        for roster in &self.rosters {
            if let Some(meta) = self.load_package_meta_roster(&roster.name, name)? {
                return Ok(Some(meta));
            }
        }
        Ok(None)
    }

    pub fn load_package_meta_roster(&self, roster: &str, name: &str) -> Result<Option<PackageMeta>> {
        validate_package_name(name)?;
        let package_dir = self.roster_dir(roster).join(PROJECTS_DIR).join(name);
        let Some(path) = META_FILE_NAMES
            .iter()
            .map(|file_name| package_dir.join(file_name))
            .find(|path| path.is_file())
        else {
            return Ok(None);
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed reading package meta: {}", path.display()))?;
        let meta = PackageMeta::from_yaml_str(&content)
            .with_context(|| format!("failed parsing package meta: {}", path.display()))?;
        Ok(Some(meta.with_roster(roster)))
    }
}

pub(crate) fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed resolving current directory")?;
    Ok(cwd.join(path))
}
