use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// A release as reported by the upstream code-hosting API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseFacts {
    pub tag: String,
    pub name: String,
    pub semantic_version: Version,
    pub tarball_url: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    pub prerelease: bool,
}

/// Parses a release name such as `v1.2`, `1.2.3` or `v2.0.0-rc.1` into a
/// semantic version. Missing minor and patch components are zero.
pub fn parse_release_version(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(anyhow!("empty release version"));
    }

    let split_at = trimmed
        .find(|ch: char| ch == '-' || ch == '+')
        .unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|part| part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()))
    {
        return Err(anyhow!("invalid release version '{input}'"));
    }

    let mut normalized = parts.join(".");
    for _ in parts.len()..3 {
        normalized.push_str(".0");
    }
    normalized.push_str(suffix);

    Version::parse(&normalized).with_context(|| format!("invalid release version '{input}'"))
}

/// Parses the `YYYY-MM-DDTHH:MM:SSZ` timestamps the upstream API emits.
pub fn parse_published_at(input: &str) -> Result<OffsetDateTime> {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    let parsed = PrimitiveDateTime::parse(input.trim(), format)
        .with_context(|| format!("invalid timestamp '{input}'"))?;
    Ok(parsed.assume_utc())
}

/// Expands `{{.tag}}`, `{{.version}}`, `{{.os}}` and `{{.arch}}` in a
/// distributable URL template. `version` is the tag without a leading `v`.
pub fn render_url_template(template: &str, tag: &str, os: &str, arch: &str) -> Result<String> {
    let version = tag.strip_prefix('v').unwrap_or(tag);
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or_else(|| anyhow!("unterminated placeholder in url template '{template}'"))?;
        let key = after_open[..end].trim();
        let key = key.strip_prefix('.').unwrap_or(key);
        let value = match key {
            "tag" => tag,
            "version" => version,
            "os" => os,
            "arch" => arch,
            other => {
                return Err(anyhow!(
                    "unknown placeholder '{other}' in url template '{template}'"
                ))
            }
        };
        out.push_str(value);
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}
