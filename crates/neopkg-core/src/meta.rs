use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STRIP_COMPONENTS: u32 = 1;

/// A package descriptor as found at `projects/<name>/package.yml` in a roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageMeta {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inject: Option<Inject>,
    pub distributable: Distributable,
    #[serde(rename = "build", default)]
    pub build_recipe: BuildRecipe,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(rename = "test", default, skip_serializing_if = "Option::is_none")]
    pub test_recipe: Option<ScriptRecipe>,
    #[serde(rename = "install", default, skip_serializing_if = "Option::is_none")]
    pub install_recipe: Option<ScriptRecipe>,
    #[serde(rename = "uninstall", default, skip_serializing_if = "Option::is_none")]
    pub uninstall_recipe: Option<ScriptRecipe>,

    #[serde(skip)]
    roster: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inject {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distributable {
    /// `<org>/<repo>` on the code-hosting service.
    pub github: String,
    /// Download URL template, see [`crate::render_url_template`].
    pub url: String,
    #[serde(default = "default_strip_components")]
    pub strip_components: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRecipe {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub script: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptRecipe {
    pub script: String,
}

impl PackageMeta {
    pub fn from_yaml_str(input: &str) -> anyhow::Result<Self> {
        let meta: Self = serde_yaml::from_str(input).context("failed to parse package meta")?;
        github_split_path(&meta.distributable.github)
            .context("invalid distributable.github")?;
        if meta.distributable.url.trim().is_empty() {
            return Err(anyhow!("distributable.url must not be empty"));
        }
        Ok(meta)
    }

    pub fn with_roster(mut self, roster: impl Into<String>) -> Self {
        self.roster = roster.into();
        self
    }

    /// Name of the roster this descriptor was loaded from.
    pub fn roster(&self) -> &str {
        &self.roster
    }

    pub fn github_org_repo(&self) -> anyhow::Result<(&str, &str)> {
        github_split_path(&self.distributable.github)
    }
}

/// Splits `org/repo` (optionally prefixed with `https://github.com/`).
pub fn github_split_path(path: &str) -> anyhow::Result<(&str, &str)> {
    let trimmed = path
        .trim()
        .trim_start_matches("https://github.com/")
        .trim_end_matches(".git")
        .trim_matches('/');
    let mut parts = trimmed.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(org), Some(repo), None) if !org.is_empty() && !repo.is_empty() => Ok((org, repo)),
        _ => Err(anyhow!("invalid github path '{path}', expected '<org>/<repo>'")),
    }
}

/// Package names double as directory components and URL keys.
pub fn validate_package_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(anyhow!("invalid package name: must not be empty"));
    }

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(anyhow!("invalid package name: '{name}'"));
    };
    let first_is_valid = first.is_ascii_lowercase() || first.is_ascii_digit();
    let rest_is_valid = chars.all(|ch| {
        ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_' || ch == '.'
    });
    if !first_is_valid || !rest_is_valid {
        return Err(anyhow!("invalid package name: '{name}'"));
    }

    Ok(())
}

fn default_strip_components() -> u32 {
    DEFAULT_STRIP_COMPONENTS
}
