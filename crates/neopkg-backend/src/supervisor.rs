use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use neopkg_core::host_os;
use neopkg_installer::{read_current, DistLayout};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, OnceCell, RwLock};
use tracing::{error, info, warn};

use crate::log_sink::spawn_log_pump;
use crate::{
    find_script, merge_env, parse_env_entries, read_env_file, reconcile_env_file,
    BackendDescriptor, EnvPairs, LogLevel, ReverseProxy,
};

pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Stopped,
    Running,
}

/// Supervisor for the single child process a package may run.
///
/// Cloning is cheap; clones share the same child.
#[derive(Debug, Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

#[derive(Debug)]
struct BackendInner {
    name: String,
    dir: PathBuf,
    env_file: PathBuf,
    descriptor: BackendDescriptor,
    install_env: EnvPairs,
    descriptor_env: EnvPairs,
    stdout_level: LogLevel,
    stderr_level: LogLevel,
    state: RwLock<BackendState>,
    proxy: OnceCell<ReverseProxy>,
}

#[derive(Debug, Default)]
struct BackendState {
    env: EnvPairs,
    child: Option<ChildHandle>,
    generation: u64,
}

#[derive(Debug)]
struct ChildHandle {
    pid: Option<u32>,
    generation: u64,
    exited: watch::Receiver<bool>,
    kill: Option<oneshot::Sender<()>>,
}

impl ChildHandle {
    fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }
}

impl Backend {
    /// Loads the backend of the version `current` selects. `Ok(None)` when
    /// the package is not installed or ships no `.backend.yml`.
    pub fn load(layout: &DistLayout, name: &str, install_env: EnvPairs) -> Result<Option<Self>> {
        let Some(current) = read_current(layout, name)? else {
            return Ok(None);
        };
        let Some(descriptor) = BackendDescriptor::load(&current.target_dir)? else {
            return Ok(None);
        };
        Self::new(
            name,
            current.target_dir,
            layout.env_file(name),
            descriptor,
            install_env,
        )
        .map(Some)
    }

    /// Reconciles `env_file` with the descriptor's env and merges the layers
    /// `install_env < descriptor env < env file`.
    pub fn new(
        name: &str,
        dir: PathBuf,
        env_file: PathBuf,
        descriptor: BackendDescriptor,
        install_env: EnvPairs,
    ) -> Result<Self> {
        let descriptor_env = parse_env_entries(&descriptor.env);
        let file_env = reconcile_env_file(&env_file, &descriptor_env)
            .with_context(|| format!("failed reconciling env file of backend '{name}'"))?;
        let env = merge_env(&[&install_env, &descriptor_env, &file_env]);
        let stdout_level = LogLevel::parse(&descriptor.stdout_log);
        let stderr_level = LogLevel::parse(&descriptor.stderr_log);

        Ok(Self {
            inner: Arc::new(BackendInner {
                name: name.to_string(),
                dir,
                env_file,
                descriptor,
                install_env,
                descriptor_env,
                stdout_level,
                stderr_level,
                state: RwLock::new(BackendState {
                    env,
                    ..BackendState::default()
                }),
                proxy: OnceCell::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.inner.descriptor
    }

    pub fn auto_start(&self) -> bool {
        self.inner.descriptor.auto_start
    }

    /// Environment the next child will see on top of the process environment.
    pub async fn env(&self) -> EnvPairs {
        self.inner.state.read().await.env.clone()
    }

    pub async fn status(&self) -> BackendStatus {
        let state = self.inner.state.read().await;
        match &state.child {
            Some(child) if child.is_alive() => BackendStatus::Running,
            _ => BackendStatus::Stopped,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        let state = self.inner.state.read().await;
        state
            .child
            .as_ref()
            .filter(|child| child.is_alive())
            .and_then(|child| child.pid)
    }

    /// Launches the start script. Returns once the process is spawned; a
    /// background task reaps it and clears the handle on exit. Starting a
    /// running backend is a no-op.
    pub async fn start(&self) -> Result<()> {
        info!(backend = %self.inner.name, "start");
        match AssertUnwindSafe(self.start_child()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(self.panicked("start", panic)),
        }
    }

    /// Runs the stop script, then waits up to [`STOP_TIMEOUT`] for the child
    /// to exit. Without a stop script for this platform the child is killed.
    pub async fn stop(&self) -> Result<()> {
        info!(backend = %self.inner.name, "stop");
        match AssertUnwindSafe(self.stop_child()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(self.panicked("stop", panic)),
        }
    }

    /// True when a running backend declares a proxy prefix that `path` falls under.
    pub async fn should_proxy(&self, path: &str) -> bool {
        let declared = self
            .inner
            .descriptor
            .http_proxy
            .as_ref()
            .is_some_and(|proxy| !proxy.prefix.is_empty() && path.starts_with(&proxy.prefix));
        declared && self.status().await == BackendStatus::Running
    }

    /// The reverse proxy, built on first use.
    pub async fn proxy(&self) -> Result<Option<&ReverseProxy>> {
        let Some(config) = self
            .inner
            .descriptor
            .http_proxy
            .as_ref()
            .filter(|proxy| !proxy.prefix.is_empty())
        else {
            return Ok(None);
        };
        self.inner
            .proxy
            .get_or_try_init(|| async { ReverseProxy::new(config, &self.inner.dir) })
            .await
            .map(Some)
    }

    /// Forwards `request` to the backend. Failures and panics become 502.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let proxy = match self.proxy().await {
            Ok(Some(proxy)) => proxy,
            Ok(None) => {
                return (StatusCode::NOT_FOUND, "backend has no http proxy").into_response()
            }
            Err(err) => {
                warn!(backend = %self.inner.name, error = %format!("{err:#}"), "invalid backend proxy");
                return (StatusCode::BAD_GATEWAY, format!("{err:#}")).into_response();
            }
        };

        match AssertUnwindSafe(proxy.forward(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(backend = %self.inner.name, error = %format!("{err:#}"), "proxy request failed");
                (StatusCode::BAD_GATEWAY, format!("{err:#}")).into_response()
            }
            Err(panic) => {
                let err = self.panicked("proxy", panic);
                (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
            }
        }
    }

    async fn start_child(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.write().await;
        if state.child.as_ref().is_some_and(ChildHandle::is_alive) {
            warn!(backend = %inner.name, "already running");
            return Ok(());
        }

        let script = find_script(&inner.descriptor.start_scripts, host_os()).with_context(|| {
            format!(
                "backend '{}' has no start script for '{}'",
                inner.name,
                host_os()
            )
        })?;
        let file_env = read_env_file(&inner.env_file)?;
        state.env = merge_env(&[&inner.install_env, &inner.descriptor_env, &file_env]);

        let mut command = script_command(&script.run);
        command
            .current_dir(&inner.dir)
            .envs(state.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(backend = %inner.name, run = %script.run, error = %err, "failed to start");
                return Err(err).with_context(|| {
                    format!("failed to start backend '{}': {}", inner.name, script.run)
                });
            }
        };

        if let Some(stdout) = child.stdout.take() {
            spawn_log_pump(stdout, inner.name.clone(), "stdout", inner.stdout_level);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pump(stderr, inner.name.clone(), "stderr", inner.stderr_level);
        }

        let pid = child.id();
        state.generation += 1;
        let generation = state.generation;
        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();
        state.child = Some(ChildHandle {
            pid,
            generation,
            exited: exited_rx,
            kill: Some(kill_tx),
        });
        tokio::spawn(Arc::clone(inner).reap(child, generation, exited_tx, kill_rx));

        info!(backend = %inner.name, pid = ?pid, run = %script.run, "backend started");
        Ok(())
    }

    async fn stop_child(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.write().await;
        let env = state.env.clone();
        if !state.child.as_ref().is_some_and(ChildHandle::is_alive) {
            warn!(backend = %inner.name, "not running");
            state.child = None;
            return Ok(());
        }
        let Some(handle) = state.child.as_mut() else {
            return Ok(());
        };
        let mut exited = handle.exited.clone();

        match find_script(&inner.descriptor.stop_scripts, host_os()) {
            Some(script) => {
                let mut command = script_command(&script.run);
                command
                    .current_dir(&inner.dir)
                    .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                let mut stopper = command.spawn().with_context(|| {
                    format!("failed to run stop script of backend '{}'", inner.name)
                })?;
                if let Some(stdout) = stopper.stdout.take() {
                    spawn_log_pump(stdout, inner.name.clone(), "stdout", inner.stdout_level);
                }
                if let Some(stderr) = stopper.stderr.take() {
                    spawn_log_pump(stderr, inner.name.clone(), "stderr", inner.stderr_level);
                }
                match stopper.wait().await {
                    Ok(status) if !status.success() => {
                        warn!(backend = %inner.name, %status, "stop script failed")
                    }
                    Ok(_) => {}
                    Err(err) => error!(backend = %inner.name, error = %err, "stop script failed"),
                }
            }
            None => {
                warn!(backend = %inner.name, "no stop script for this platform, killing process");
                if let Some(kill) = handle.kill.take() {
                    let _ = kill.send(());
                }
            }
        }

        let mut waited = Duration::ZERO;
        loop {
            let done = *exited.borrow_and_update();
            if done {
                break;
            }
            if waited >= STOP_TIMEOUT {
                warn!(backend = %inner.name, "timeout waiting for backend to exit");
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
            waited += STOP_POLL_INTERVAL;
        }

        state.child = None;
        info!(backend = %inner.name, "backend stopped");
        Ok(())
    }

    fn panicked(&self, op: &str, panic: Box<dyn Any + Send>) -> anyhow::Error {
        let message = panic
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(backend = %self.inner.name, op, panic = %message, "recovered from panic");
        anyhow!("backend '{}' {op} panicked: {message}", self.inner.name)
    }
}

impl BackendInner {
    async fn reap(
        self: Arc<Self>,
        mut child: Child,
        generation: u64,
        exited: watch::Sender<bool>,
        mut kill: oneshot::Receiver<()>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill => {
                if let Err(err) = child.start_kill() {
                    warn!(backend = %self.name, error = %err, "failed to kill backend");
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => info!(backend = %self.name, code = ?status.code(), "exit code"),
            Err(err) => error!(backend = %self.name, error = %err, "fail to run"),
        }
        let _ = exited.send(true);

        let mut state = self.state.write().await;
        if state
            .child
            .as_ref()
            .is_some_and(|child| child.generation == generation)
        {
            state.child = None;
        }
    }
}

/// Joins a multi-line script into one command line, dropping trailing line
/// continuations, and wraps it in `sh -c` (`cmd /c` on Windows).
pub fn script_command(script: &str) -> Command {
    let mut command = if cfg!(windows) {
        let line = script
            .lines()
            .map(|line| line.trim().trim_end_matches('^'))
            .collect::<Vec<_>>()
            .join(" ");
        let mut command = Command::new("cmd");
        command.arg("/c").arg(line);
        command
    } else {
        let line = script
            .lines()
            .map(|line| line.strip_suffix('\\').unwrap_or(line).trim())
            .collect::<Vec<_>>()
            .join(" ");
        let mut command = Command::new("sh");
        command.arg("-c").arg(line);
        command
    };
    command.kill_on_drop(true);
    command
}
