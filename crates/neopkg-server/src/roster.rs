use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use neopkg_core::{
    host_arch, host_os, parse_release_version, render_url_template, validate_package_name,
    ArchiveType, PackageCache, PackageMeta, PkgError,
};
use neopkg_installer::{
    download_archive, extract_archive_blocking, publish_current, read_current, remove_installed,
    run_script, safe_installed_path, CurrentVersion, DistLayout,
};
use neopkg_registry::{CacheStore, Catalog, RosterSyncStatus};
use neopkg_resolver::{rank_candidates, GithubClient};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ServerConfig;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SearchResult {
    pub exact: Option<PackageCache>,
    pub possibles: Vec<PackageCache>,
}

/// Outcome of syncing one roster and refreshing the caches of its packages.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub roster: String,
    pub status: RosterSyncStatus,
    pub snapshot_id: String,
    pub packages: usize,
    pub refreshed: usize,
    pub failed: Vec<String>,
}

/// Catalog, upstream resolver, cache and dist tree tied together into the
/// package operations: sync, search, install and uninstall.
#[derive(Debug)]
pub struct Roster {
    catalog: Catalog,
    layout: DistLayout,
    github: GithubClient,
    http: reqwest::Client,
    cache_ttl: Duration,
    install_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Roster {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let catalog = Catalog::new(&config.meta_dir, config.rosters.clone())?;
        let github = GithubClient::from_env(&config.github_api, config.request_timeout())?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .context("failed building download http client")?;
        Self::from_parts(catalog, &config.dist_dir, github, http, config.cache_ttl())
    }

    pub fn from_parts(
        catalog: Catalog,
        dist_dir: &Path,
        github: GithubClient,
        http: reqwest::Client,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let dist_dir = if dist_dir.is_absolute() {
            dist_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .context("failed resolving current directory")?
                .join(dist_dir)
        };
        std::fs::create_dir_all(&dist_dir)
            .with_context(|| format!("failed creating dist directory {}", dist_dir.display()))?;

        Ok(Self {
            catalog,
            layout: DistLayout::new(dist_dir),
            github,
            http,
            cache_ttl,
            install_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn layout(&self) -> &DistLayout {
        &self.layout
    }

    pub fn installed_version(&self, name: &str) -> Result<Option<CurrentVersion>> {
        validate_package_name(name)?;
        read_current(&self.layout, name)
    }

    /// Syncs every roster, then refreshes the cache of each package it holds.
    /// Refresh failures are collected per package rather than aborting.
    pub async fn sync(&self) -> Result<Vec<SyncSummary>> {
        let results = self.catalog.sync().await?;
        let mut summaries = Vec::with_capacity(results.len());
        for result in results {
            let mut names = Vec::new();
            self.catalog.walk_roster_packages(&result.roster, |name| {
                names.push(name.to_string());
                true
            })?;

            let mut summary = SyncSummary {
                roster: result.roster.clone(),
                status: result.status,
                snapshot_id: result.snapshot_id.clone(),
                packages: names.len(),
                refreshed: 0,
                failed: Vec::new(),
            };
            for name in names {
                match self.refresh_roster_package(&result.roster, &name).await {
                    Ok(true) => summary.refreshed += 1,
                    Ok(false) => debug!(roster = %result.roster, package = %name, "no package meta"),
                    Err(err) => {
                        warn!(roster = %result.roster, package = %name, error = %format!("{err:#}"), "cache refresh failed");
                        summary.failed.push(name);
                    }
                }
            }
            info!(
                roster = %summary.roster,
                packages = summary.packages,
                refreshed = summary.refreshed,
                failed = summary.failed.len(),
                "roster synced"
            );
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Returns the cache of `meta`'s package, refreshing from upstream when
    /// `force_refresh` is set. Without a refresh a missing cache is `None`.
    pub async fn load_package_cache(
        &self,
        name: &str,
        meta: &PackageMeta,
        force_refresh: bool,
    ) -> Result<Option<PackageCache>> {
        if force_refresh {
            return self.refresh_cache(name, meta).await.map(Some);
        }
        self.cache_store_for(meta)?.read_cache(name)
    }

    /// Queries upstream for the latest release and rewrites the cache. The
    /// install fields are recomputed from the `current` link.
    pub async fn refresh_cache(&self, name: &str, meta: &PackageMeta) -> Result<PackageCache> {
        let store = self.cache_store_for(meta)?;
        let mut cache = match store.read_cache(name) {
            Ok(cache) => cache.unwrap_or_else(|| PackageCache::new(name)),
            Err(err) => {
                warn!(package = name, error = %format!("{err:#}"), "discarding unreadable cache");
                PackageCache::new(name)
            }
        };

        let (org, repo) = meta.github_org_repo()?;
        let repo_info = self.github.repo_info(org, repo).await?;
        let release = self.github.latest_release(org, repo).await?;
        let url = render_url_template(&meta.distributable.url, &release.tag, host_os(), host_arch())
            .with_context(|| format!("failed rendering download url of '{name}'"))?;

        cache.name = name.to_string();
        cache.github = Some(repo_info);
        cache.latest_release = release.semantic_version.to_string();
        cache.latest_release_tag = release.tag;
        cache.published_at = release.published_at;
        cache.url = url;
        cache.strip_components = meta.distributable.strip_components;
        cache.cached_at = Some(OffsetDateTime::now_utc());
        self.heal_installed(&mut cache)?;
        store.write_cache(&cache)?;

        debug!(package = name, latest = %cache.latest_release, "cache refreshed");
        Ok(cache)
    }

    /// `exact` holds the package itself when the catalog knows it; `possibles`
    /// holds up to `possibles` similar cached packages. An empty name lists
    /// cached packages in name order instead. A query that is not a valid
    /// package name (e.g. mixed case) only gets `possibles`.
    pub async fn search(&self, name: &str, possibles: usize) -> Result<SearchResult> {
        let mut result = SearchResult::default();
        if !name.is_empty() {
            match validate_package_name(name) {
                Ok(()) => {
                    if let Some(meta) = self.catalog.load_package_meta(name)? {
                        result.exact = Some(self.fresh_cache(name, &meta).await?);
                    }
                }
                Err(err) => debug!(query = name, error = %err, "no exact match for query"),
            }
        }
        if possibles == 0 {
            return Ok(result);
        }

        let mut cached = self.cached_packages()?;
        if name.is_empty() {
            result.possibles = cached.into_values().take(possibles).collect();
        } else {
            let ranked = rank_candidates(name, cached.keys(), possibles);
            result.possibles = ranked
                .into_iter()
                .filter_map(|ranked| cached.remove(&ranked.name))
                .collect();
        }
        Ok(result)
    }

    /// Downloads the latest release, unpacks it into its version directory,
    /// switches `current` to it, records it in the cache and finally runs the
    /// install hook. A failing hook leaves the new version active.
    pub async fn install<W>(
        &self,
        name: &str,
        env: &[(String, String)],
        output: &mut W,
    ) -> Result<PackageCache>
    where
        W: AsyncWrite + Unpin,
    {
        validate_package_name(name)?;
        let lock = self.install_lock(name).await;
        let _guard = lock.lock().await;

        let meta = self
            .catalog
            .load_package_meta(name)?
            .ok_or_else(|| PkgError::NotFound(name.to_string()))?;
        let mut cache = self.refresh_cache(name, &meta).await?;
        let archive_type = ArchiveType::infer_from_url(&cache.url)
            .ok_or_else(|| PkgError::UnsupportedArchive(cache.url.clone()))?;

        let version = cache.latest_release.clone();
        let version_dir = self.layout.version_dir(name, &version);
        tokio::fs::create_dir_all(&version_dir)
            .await
            .with_context(|| format!("failed creating {}", version_dir.display()))?;
        let archive = self.layout.archive_path(name, &version, archive_type);
        let bytes = download_archive(&self.http, &cache.url, &archive).await?;
        info!(package = name, %version, bytes, url = %cache.url, "downloaded");

        extract_archive_blocking(
            archive_type,
            archive.clone(),
            version_dir.clone(),
            cache.strip_components as usize,
        )
        .await
        .with_context(|| format!("failed extracting {}", archive.display()))?;
        let link = publish_current(&self.layout, name, &version)?;

        cache.installed_version = version.clone();
        cache.installed_path = link.display().to_string();
        cache.cached_at = Some(OffsetDateTime::now_utc());
        self.cache_store_for(&meta)?.write_cache(&cache)?;
        info!(package = name, %version, path = %link.display(), "installed");

        if let Some(recipe) = &meta.install_recipe {
            run_script(&recipe.script, &link, env, output)
                .await
                .with_context(|| format!("install script of '{name}' failed"))?;
        }
        Ok(cache)
    }

    /// Runs the uninstall hook, removes the active version and clears the
    /// install fields. Works from the cache alone, without upstream access.
    pub async fn uninstall<W>(&self, name: &str, env: &[(String, String)], output: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        validate_package_name(name)?;
        let lock = self.install_lock(name).await;
        let _guard = lock.lock().await;

        let meta = self.catalog.load_package_meta(name)?;
        let (store, mut cache) = match self.find_cache(name, meta.as_ref())? {
            Some(found) => found,
            None => {
                let store = match &meta {
                    Some(meta) => self.cache_store_for(meta)?,
                    None => self.catalog.primary_cache_store(),
                };
                (store, PackageCache::new(name))
            }
        };
        if cache.installed_path.is_empty() {
            let current = read_current(&self.layout, name)?
                .ok_or_else(|| PkgError::NotInstalled(name.to_string()))?;
            cache.installed_path = current.link.display().to_string();
        }
        let path = safe_installed_path(&self.layout, name, &cache.installed_path)?;

        if let Some(recipe) = meta.as_ref().and_then(|meta| meta.uninstall_recipe.as_ref()) {
            if path.is_dir() {
                run_script(&recipe.script, &path, env, output)
                    .await
                    .with_context(|| format!("uninstall script of '{name}' failed"))?;
            }
        }

        let removed = remove_installed(&self.layout, name, &path)?;
        cache.clear_installed();
        cache.cached_at = Some(OffsetDateTime::now_utc());
        store.write_cache(&cache)?;
        info!(package = name, removed = removed.paths.len(), "uninstalled");
        Ok(())
    }

    async fn refresh_roster_package(&self, roster: &str, name: &str) -> Result<bool> {
        let Some(meta) = self.catalog.load_package_meta_roster(roster, name)? else {
            return Ok(false);
        };
        self.refresh_cache(name, &meta).await?;
        Ok(true)
    }

    /// The cached entry while it is younger than the TTL, else a refresh. A
    /// failed refresh falls back to the stale entry when there is one.
    async fn fresh_cache(&self, name: &str, meta: &PackageMeta) -> Result<PackageCache> {
        let store = self.cache_store_for(meta)?;
        let cached = store.read_cache(name).unwrap_or_else(|err| {
            warn!(package = name, error = %format!("{err:#}"), "ignoring unreadable cache");
            None
        });

        if let Some(mut cache) = cached.clone().filter(|cache| self.is_fresh(cache)) {
            self.heal_installed(&mut cache)?;
            return Ok(cache);
        }
        match self.refresh_cache(name, meta).await {
            Ok(cache) => Ok(cache),
            Err(err) => match cached {
                Some(mut stale) => {
                    warn!(package = name, error = %format!("{err:#}"), "refresh failed, using stale cache");
                    self.heal_installed(&mut stale)?;
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    fn is_fresh(&self, cache: &PackageCache) -> bool {
        let Some(cached_at) = cache.cached_at else {
            return false;
        };
        let age = OffsetDateTime::now_utc() - cached_at;
        !age.is_negative() && age.unsigned_abs() < self.cache_ttl
    }

    /// Sets the install fields from the `current` link, blanking them when
    /// the link is gone or does not name a version.
    fn heal_installed(&self, cache: &mut PackageCache) -> Result<()> {
        match read_current(&self.layout, &cache.name)? {
            Some(current) => match parse_release_version(&current.version) {
                Ok(version) => {
                    cache.installed_version = version.to_string();
                    cache.installed_path = current.link.display().to_string();
                }
                Err(err) => {
                    warn!(package = %cache.name, link = %current.link.display(), error = %err, "current link does not name a version");
                    cache.clear_installed();
                }
            },
            None => {
                if cache.is_installed() {
                    debug!(package = %cache.name, "installed tree is gone, clearing cache install fields");
                }
                cache.clear_installed();
            }
        }
        Ok(())
    }

    /// Cached entries of every roster by name; the first roster wins.
    fn cached_packages(&self) -> Result<BTreeMap<String, PackageCache>> {
        let mut seen = BTreeSet::new();
        let mut cached = BTreeMap::new();
        for roster in self.catalog.rosters() {
            let Some(store) = self.catalog.cache_store(&roster.name) else {
                continue;
            };
            store.walk_caches(|cache| {
                if seen.insert(cache.name.clone()) {
                    cached.insert(cache.name.clone(), cache);
                }
                true
            })?;
        }
        Ok(cached)
    }

    fn find_cache(
        &self,
        name: &str,
        meta: Option<&PackageMeta>,
    ) -> Result<Option<(&CacheStore, PackageCache)>> {
        if let Some(meta) = meta {
            let store = self.cache_store_for(meta)?;
            return Ok(store.read_cache(name)?.map(|cache| (store, cache)));
        }
        for roster in self.catalog.rosters() {
            let Some(store) = self.catalog.cache_store(&roster.name) else {
                continue;
            };
            if let Some(cache) = store.read_cache(name)? {
                return Ok(Some((store, cache)));
            }
        }
        Ok(None)
    }

    fn cache_store_for(&self, meta: &PackageMeta) -> Result<&CacheStore> {
        self.catalog
            .cache_store(meta.roster())
            .with_context(|| format!("unknown roster '{}'", meta.roster()))
    }

    async fn install_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.install_locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }
}
