use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use neopkg_registry::{default_rosters, RosterSource};
use neopkg_resolver::DEFAULT_GITHUB_API;
use serde::Deserialize;
use tracing::debug;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "NEOPKG_CONFIG";

fn default_listen() -> String {
    "127.0.0.1:5680".into()
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("./pkgs/meta")
}

fn default_dist_dir() -> PathBuf {
    PathBuf::from("./pkgs/dist")
}

fn default_github_api() -> String {
    DEFAULT_GITHUB_API.into()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_operation_timeout_secs() -> u64 {
    600
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,
    #[serde(default = "default_dist_dir")]
    pub dist_dir: PathBuf,
    #[serde(default = "default_github_api")]
    pub github_api: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub sync_on_start: bool,
    /// Extra variables handed to install hooks and backends.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_rosters")]
    pub rosters: Vec<RosterSource>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<AuthToken>,
}

/// A bearer token, stored as the hex SHA-256 of the token, and the claim
/// subject it grants.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthToken {
    pub subject: String,
    pub sha256: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            meta_dir: default_meta_dir(),
            dist_dir: default_dist_dir(),
            github_api: default_github_api(),
            request_timeout_secs: default_request_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            sync_on_start: false,
            env: BTreeMap::new(),
            rosters: default_rosters(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, else the file named by `NEOPKG_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        };
        let Some(path) = path else {
            debug!("no config file given, using defaults");
            return Ok(Self::default());
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.rosters.is_empty() {
            anyhow::bail!("at least one roster must be configured");
        }
        let mut seen = HashSet::new();
        for roster in &self.rosters {
            if roster.url.trim().is_empty() {
                anyhow::bail!("roster '{}' has no url", roster.name);
            }
            if !seen.insert(roster.name.as_str()) {
                anyhow::bail!("roster '{}' is configured twice", roster.name);
            }
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }
        if self.operation_timeout_secs == 0 {
            anyhow::bail!("operation_timeout_secs must be greater than 0");
        }
        for token in &self.auth.tokens {
            if token.subject.trim().is_empty() {
                anyhow::bail!("auth token subject must not be empty");
            }
            let digest_is_valid = token.sha256.len() == 64
                && token.sha256.chars().all(|ch| ch.is_ascii_hexdigit());
            if !digest_is_valid {
                anyhow::bail!(
                    "auth token for '{}' must be a 64-character sha256 hex digest",
                    token.subject
                );
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
