use std::collections::BTreeMap;
use std::fs;
use std::str::FromStr;

use anyhow::{Context, Result};
use neopkg_backend::{Backend, BackendStatus, EnvPairs};
use neopkg_core::{PackageCache, PkgError};
use neopkg_installer::DistLayout;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{Roster, SearchResult, ServerConfig, SyncSummary};

/// Variable naming the server executable in hook and backend environments.
pub const HOST_ENV: &str = "NEOPKG_HOST";

const INHERITED_ENV: [&str; 6] = ["USER", "HOME", "LANG", "LC_NUMERIC", "LC_TIME", "TZ"];
#[cfg(windows)]
const INHERITED_ENV_WINDOWS: [&str; 3] = ["SystemRoot", "SystemDrive", "USERPROFILE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    Start,
    Stop,
    Status,
}

impl FromStr for ProcessAction {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "status" => Ok(Self::Status),
            other => Err(anyhow::anyhow!(
                "unknown process action '{other}'; expected start, stop or status"
            )),
        }
    }
}

/// Owns the roster and the backends of installed packages.
#[derive(Debug)]
pub struct PkgManager {
    roster: Roster,
    install_env: EnvPairs,
    backends: RwLock<BTreeMap<String, Backend>>,
}

impl PkgManager {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let roster = Roster::new(config)?;
        Self::with_roster(roster, installer_env(&config.env))
    }

    /// Loads the backend of every package under the dist tree that has a
    /// `current` link. A broken descriptor is logged and skipped.
    pub fn with_roster(roster: Roster, install_env: EnvPairs) -> Result<Self> {
        let backends = scan_backends(roster.layout(), &install_env)?;
        info!(backends = backends.len(), "package manager ready");
        Ok(Self {
            roster,
            install_env,
            backends: RwLock::new(backends),
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Starts every `auto_start` backend.
    pub async fn start(&self) {
        for backend in self.backends.read().await.values() {
            if !backend.auto_start() {
                continue;
            }
            if let Err(err) = backend.start().await {
                warn!(package = backend.name(), error = %format!("{err:#}"), "backend failed to start");
            }
        }
    }

    pub async fn stop(&self) {
        for backend in self.backends.read().await.values() {
            if let Err(err) = backend.stop().await {
                warn!(package = backend.name(), error = %format!("{err:#}"), "backend failed to stop");
            }
        }
    }

    pub async fn backend(&self, name: &str) -> Option<Backend> {
        self.backends.read().await.get(name).cloned()
    }

    pub async fn sync(&self) -> Result<Vec<SyncSummary>> {
        self.roster.sync().await
    }

    pub async fn search(&self, name: &str, possibles: usize) -> Result<SearchResult> {
        self.roster.search(name, possibles).await
    }

    /// Installs the latest release, then swaps in the backend of the new
    /// version. The new backend starts when it is `auto_start` or when the
    /// previous one was running.
    pub async fn install<W>(&self, name: &str, output: &mut W) -> Result<PackageCache>
    where
        W: AsyncWrite + Unpin,
    {
        info!(package = name, "installing");
        let cache = self.roster.install(name, &self.install_env, output).await?;
        self.replace_backend(name).await;
        Ok(cache)
    }

    /// Stops the package's backend, uninstalls it and forgets the backend.
    pub async fn uninstall<W>(&self, name: &str, output: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        info!(package = name, "uninstalling");
        if let Some(backend) = self.backend(name).await {
            if let Err(err) = backend.stop().await {
                warn!(package = name, error = %format!("{err:#}"), "backend failed to stop");
            }
        }
        self.roster
            .uninstall(name, &self.install_env, output)
            .await?;
        self.backends.write().await.remove(name);
        Ok(())
    }

    pub async fn process(&self, name: &str, action: ProcessAction) -> Result<BackendStatus> {
        let backend = self
            .backend(name)
            .await
            .ok_or_else(|| PkgError::NotFound(name.to_string()))?;
        match action {
            ProcessAction::Start => backend.start().await?,
            ProcessAction::Stop => backend.stop().await?,
            ProcessAction::Status => {}
        }
        Ok(backend.status().await)
    }

    /// Swaps in the backend of a freshly installed version. The map lock is
    /// only held to take out and put back entries, never across stop/start.
    async fn replace_backend(&self, name: &str) {
        let previous = self.backends.write().await.remove(name);
        let mut was_running = false;
        if let Some(previous) = previous {
            was_running = previous.status().await == BackendStatus::Running;
            if was_running {
                if let Err(err) = previous.stop().await {
                    warn!(package = name, error = %format!("{err:#}"), "previous backend failed to stop");
                }
            }
        }

        let backend = match Backend::load(self.roster.layout(), name, self.install_env.clone()) {
            Ok(Some(backend)) => backend,
            Ok(None) => return,
            Err(err) => {
                warn!(package = name, error = %format!("{err:#}"), "failed to load backend");
                return;
            }
        };
        if backend.auto_start() || was_running {
            if let Err(err) = backend.start().await {
                warn!(package = name, error = %format!("{err:#}"), "backend failed to start");
            }
        }
        self.backends.write().await.insert(name.to_string(), backend);
    }
}

/// Environment for install hooks and backends: a few inherited variables,
/// the configured `[env]` table and the server executable path.
pub fn installer_env(extra: &BTreeMap<String, String>) -> EnvPairs {
    let mut keys: Vec<&str> = INHERITED_ENV.to_vec();
    #[cfg(windows)]
    keys.extend(INHERITED_ENV_WINDOWS);

    let mut env: EnvPairs = keys
        .into_iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| (key.to_string(), value))
        })
        .collect();
    env.extend(extra.iter().map(|(key, value)| (key.clone(), value.clone())));
    if let Ok(exe) = std::env::current_exe() {
        env.push((HOST_ENV.to_string(), exe.display().to_string()));
    }
    env
}

fn scan_backends(layout: &DistLayout, install_env: &EnvPairs) -> Result<BTreeMap<String, Backend>> {
    let mut backends = BTreeMap::new();
    let entries = fs::read_dir(layout.root())
        .with_context(|| format!("failed reading dist directory {}", layout.root().display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match Backend::load(layout, &name, install_env.clone()) {
            Ok(Some(backend)) => {
                backends.insert(name, backend);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(package = %name, error = %format!("{err:#}"), "failed to load backend settings");
            }
        }
    }
    Ok(backends)
}
