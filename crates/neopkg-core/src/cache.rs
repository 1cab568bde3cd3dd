use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Facts computed about one package, persisted as `cache.yml`.
///
/// `installed_version` and `installed_path` are both empty when the package
/// is not installed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageCache {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubRepoInfo>,
    #[serde(default)]
    pub latest_release: String,
    #[serde(default)]
    pub latest_release_tag: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub strip_components: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cached_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub installed_version: String,
    #[serde(default)]
    pub installed_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GithubRepoInfo {
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub default_branch: String,
}

impl PackageCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(input: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(input).context("failed to parse package cache")
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("failed to serialize package cache")
    }

    pub fn is_installed(&self) -> bool {
        !self.installed_version.is_empty() && !self.installed_path.is_empty()
    }

    pub fn clear_installed(&mut self) {
        self.installed_version.clear();
        self.installed_path.clear();
    }
}
