use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const BACKEND_FILE_NAME: &str = ".backend.yml";

/// Contents of `<installed>/.backend.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendDescriptor {
    #[serde(rename = "start", default)]
    pub start_scripts: Vec<BackendScript>,
    #[serde(rename = "stop", default)]
    pub stop_scripts: Vec<BackendScript>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub stdout_log: String,
    #[serde(default)]
    pub stderr_log: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendScript {
    pub run: String,
    /// Target OS using Go-style names (`linux`, `darwin`, `windows`); empty
    /// means any platform.
    #[serde(rename = "on", default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpProxyConfig {
    pub prefix: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub strip_prefix: String,
}

impl BackendDescriptor {
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context("failed to parse backend descriptor")
    }

    /// Reads the descriptor of an installed tree; `Ok(None)` when the package
    /// ships no backend.
    pub fn load(installed_dir: &Path) -> Result<Option<Self>> {
        let path = installed_dir.join(BACKEND_FILE_NAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", path.display()))
            }
        };
        Self::from_yaml_str(&content)
            .with_context(|| format!("invalid backend descriptor {}", path.display()))
            .map(Some)
    }
}

/// First script whose platform equals `os`, else the first platform-less one.
pub fn find_script<'a>(scripts: &'a [BackendScript], os: &str) -> Option<&'a BackendScript> {
    let runnable = || scripts.iter().filter(|script| !script.run.trim().is_empty());
    runnable()
        .find(|script| script.platform == os)
        .or_else(|| runnable().find(|script| script.platform.is_empty()))
}
