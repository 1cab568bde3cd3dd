use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Builds `sh -c <script>` (`cmd /c` on Windows).
pub fn shell_command(script: &str) -> Command {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/c").arg(script);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    };
    command.kill_on_drop(true);
    command
}

/// Runs a package hook to completion in `cwd`, copying its stdout and stderr
/// line by line into `output`. A non-zero exit is an error.
pub async fn run_script<W>(
    script: &str,
    cwd: &Path,
    env: &[(String, String)],
    output: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut command = shell_command(script);
    command
        .current_dir(cwd)
        .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(cwd = %cwd.display(), "running package script");
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to launch script in {}", cwd.display()))?;
    let stdout = child.stdout.take().context("script stdout was not captured")?;
    let stderr = child.stderr.take().context("script stderr was not captured")?;
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();

    let (mut stdout_done, mut stderr_done) = (false, false);
    while !(stdout_done && stderr_done) {
        let line = tokio::select! {
            line = stdout.next_line(), if !stdout_done => match line? {
                Some(line) => Some(line),
                None => {
                    stdout_done = true;
                    None
                }
            },
            line = stderr.next_line(), if !stderr_done => match line? {
                Some(line) => Some(line),
                None => {
                    stderr_done = true;
                    None
                }
            },
        };
        if let Some(line) = line {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
    }
    output.flush().await?;

    let status = child
        .wait()
        .await
        .with_context(|| format!("failed waiting for script in {}", cwd.display()))?;
    if !status.success() {
        warn!(cwd = %cwd.display(), %status, "package script failed");
        anyhow::bail!("script in {} exited with {status}", cwd.display());
    }
    Ok(())
}
