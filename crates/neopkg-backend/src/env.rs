use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

pub type EnvPairs = Vec<(String, String)>;

/// Parses `K=V` entries, skipping blanks, `#` comments and lines without `=`.
/// A repeated key keeps its first position and its last value.
pub fn parse_env_entries<I, S>(entries: I) -> EnvPairs
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let pairs: EnvPairs = entries
        .into_iter()
        .filter_map(|line| parse_env_line(line.as_ref()))
        .collect();
    merge_env(&[&pairs])
}

/// Reads a `storage/.env` file. A missing file is empty.
pub fn read_env_file(path: &Path) -> Result<EnvPairs> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_env_entries(content.lines())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
    }
}

/// Brings the user env file in line with the descriptor's keys: keys the
/// descriptor introduced are appended with the descriptor value, keys it no
/// longer declares are dropped, and user values of retained keys are kept.
/// Comments and blank lines survive. Returns the resulting pairs.
pub fn reconcile_env_file(path: &Path, descriptor_env: &[(String, String)]) -> Result<EnvPairs> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()))
        }
    };

    let declared: HashSet<&str> = descriptor_env.iter().map(|(key, _)| key.as_str()).collect();
    let mut kept: HashSet<String> = HashSet::new();
    let mut lines: Vec<String> = Vec::new();
    for raw in existing.as_deref().unwrap_or_default().lines() {
        match parse_env_line(raw) {
            None => lines.push(raw.to_string()),
            Some((key, _)) if declared.contains(key.as_str()) && !kept.contains(&key) => {
                kept.insert(key);
                lines.push(raw.to_string());
            }
            Some((key, _)) => debug!(path = %path.display(), %key, "dropping env key"),
        }
    }
    for (key, value) in descriptor_env {
        if kept.insert(key.clone()) {
            lines.push(format!("{key}={value}"));
        }
    }

    let rendered = if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    };
    let unchanged = match existing.as_deref() {
        Some(content) => content == rendered,
        None => rendered.is_empty(),
    };
    if !unchanged {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        fs::write(path, &rendered).with_context(|| format!("failed writing {}", path.display()))?;
    }

    Ok(parse_env_entries(rendered.lines()))
}

/// Layers env pairs in ascending precedence. Keys keep the position of their
/// first appearance.
pub fn merge_env(layers: &[&[(String, String)]]) -> EnvPairs {
    let mut merged: EnvPairs = Vec::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            match merged.iter_mut().find(|(existing, _)| existing == key) {
                Some(slot) => slot.1 = value.clone(),
                None => merged.push((key.clone(), value.clone())),
            }
        }
    }
    merged
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}
