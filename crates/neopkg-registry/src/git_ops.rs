use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;

pub(crate) fn base_git_command() -> Command {
    let mut command = Command::new("git");
    command
        .arg("-c")
        .arg("core.autocrlf=false")
        .arg("-c")
        .arg("core.eol=lf")
        .arg("-c")
        .arg("advice.detachedHead=false");
    if cfg!(windows) {
        command.arg("-c").arg("core.longpaths=true");
    }
    command.env("GIT_TERMINAL_PROMPT", "0");
    command.kill_on_drop(true);
    command
}

pub(crate) async fn run_git_clone(
    location: &str,
    branch: &str,
    destination: &Path,
    roster: &str,
) -> Result<()> {
    let output = base_git_command()
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg("--single-branch")
        .arg("--branch")
        .arg(branch)
        .arg("--")
        .arg(location)
        .arg(destination)
        .output()
        .await
        .with_context(|| format!("roster-sync-failed: roster '{roster}' failed launching git clone"))?;
    if !output.status.success() {
        anyhow::bail!(
            "roster-sync-failed: roster '{}' git clone failed: {}",
            roster,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub(crate) async fn run_git_command(repo_root: &Path, args: &[&str], roster: &str) -> Result<()> {
    let output = base_git_command()
        .args(args)
        .current_dir(repo_root)
        .output()
        .await
        .with_context(|| {
            format!(
                "roster-sync-failed: roster '{}' failed launching git {}",
                roster,
                args.join(" ")
            )
        })?;
    if !output.status.success() {
        anyhow::bail!(
            "roster-sync-failed: roster '{}' git {} failed: {}",
            roster,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub(crate) async fn git_head_snapshot_id(repo_root: &Path, roster: &str) -> Result<String> {
    let output = base_git_command()
        .arg("rev-parse")
        .arg("HEAD")
        .current_dir(repo_root)
        .output()
        .await
        .with_context(|| {
            format!("roster-sync-failed: roster '{roster}' failed launching git rev-parse")
        })?;
    if !output.status.success() {
        anyhow::bail!(
            "roster-sync-failed: roster '{}' git rev-parse failed: {}",
            roster,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let full_sha = String::from_utf8(output.stdout)
        .context("roster-sync-failed: git rev-parse produced non-UTF-8 output")?;
    derive_snapshot_id_from_full_git_sha(&full_sha).with_context(|| {
        format!("roster-sync-failed: roster '{roster}' git rev-parse returned invalid HEAD sha")
    })
}

pub(crate) fn derive_snapshot_id_from_full_git_sha(full_sha: &str) -> Result<String> {
    let normalized = full_sha.trim();
    if normalized.len() < 16 {
        anyhow::bail!("git HEAD sha too short for snapshot id: '{normalized}'");
    }
    if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        anyhow::bail!("git HEAD sha contains non-hex characters: '{normalized}'");
    }

    Ok(format!(
        "git:{}",
        normalized.chars().take(16).collect::<String>()
    ))
}
