use std::time::Duration;

use anyhow::{Context, Result};
use neopkg_core::{parse_published_at, parse_release_version, GithubRepoInfo, PkgError, ReleaseFacts};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

const API_VERSION_HEADER: &str = "x-github-api-version";
const API_VERSION: &str = "2022-11-28";

/// Stateless client for the repository and release endpoints of a
/// GitHub-compatible API. Responses are never cached here.
#[derive(Debug, Clone)]
pub struct GithubClient {
    api_base: String,
    token: Option<String>,
    client: Client,
}

impl GithubClient {
    pub fn new(api_base: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("failed building upstream http client")?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|token| !token.trim().is_empty()),
            client,
        })
    }

    /// Like [`GithubClient::new`], with the bearer token taken from `GITHUB_TOKEN`.
    pub fn from_env(api_base: &str, timeout: Duration) -> Result<Self> {
        Self::new(api_base, std::env::var(GITHUB_TOKEN_ENV).ok(), timeout)
    }

    pub async fn repo_info(&self, org: &str, repo: &str) -> Result<GithubRepoInfo> {
        let url = format!("{}/repos/{org}/{repo}", self.api_base);
        let payload: RepoPayload = self.get_json(&url).await?;
        Ok(GithubRepoInfo {
            organization: payload
                .owner
                .map(|owner| owner.login)
                .unwrap_or_else(|| org.to_string()),
            repo: repo.to_string(),
            name: payload.name,
            full_name: payload.full_name,
            description: payload.description.unwrap_or_default(),
            homepage: payload.homepage.unwrap_or_default(),
            language: payload.language.unwrap_or_default(),
            license: payload
                .license
                .map(|license| license.spdx_id.or(license.name).unwrap_or_default())
                .unwrap_or_default(),
            default_branch: payload.default_branch,
        })
    }

    pub async fn latest_release(&self, org: &str, repo: &str) -> Result<ReleaseFacts> {
        let url = format!("{}/repos/{org}/{repo}/releases/latest", self.api_base);
        let payload: ReleasePayload = self.get_json(&url).await?;
        payload.into_facts()
    }

    pub async fn release_by_tag(&self, org: &str, repo: &str, tag: &str) -> Result<ReleaseFacts> {
        let url = format!("{}/repos/{org}/{repo}/releases/tags/{tag}", self.api_base);
        let payload: ReleasePayload = self.get_json(&url).await?;
        payload.into_facts()
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        headers.insert(USER_AGENT, HeaderValue::from_static("neopkg"));
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("upstream token contains invalid header characters")?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(%url, "querying upstream api");
        let response = self
            .client
            .get(url)
            .headers(self.headers()?)
            .send()
            .await
            .with_context(|| format!("failed requesting {url}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PkgError::Upstream {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("failed decoding response from {url}"))
    }
}

#[derive(Debug, Deserialize)]
struct RepoPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    license: Option<LicensePayload>,
    #[serde(default)]
    default_branch: String,
    #[serde(default)]
    owner: Option<OwnerPayload>,
}

#[derive(Debug, Deserialize)]
struct LicensePayload {
    #[serde(default)]
    spdx_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnerPayload {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ReleasePayload {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tarball_url: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    prerelease: bool,
}

impl ReleasePayload {
    fn into_facts(self) -> Result<ReleaseFacts> {
        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.tag_name.clone());
        let semantic_version = parse_release_version(&name)
            .or_else(|_| parse_release_version(&self.tag_name))
            .with_context(|| format!("release '{}' has no usable version", self.tag_name))?;
        let published_at = self
            .published_at
            .as_deref()
            .map(parse_published_at)
            .transpose()?;

        Ok(ReleaseFacts {
            tag: self.tag_name,
            name,
            semantic_version,
            tarball_url: self.tarball_url.unwrap_or_default(),
            published_at,
            prerelease: self.prerelease,
        })
    }
}
