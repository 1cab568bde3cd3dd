mod auth;
mod config;
mod manager;
mod roster;
mod routes;
mod static_files;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use auth::{attach_claim, require_admin, Claim, TokenAuth, ADMIN_SUBJECT};
pub use config::{AuthConfig, AuthToken, ServerConfig, CONFIG_ENV};
pub use manager::{installer_env, PkgManager, ProcessAction, HOST_ENV};
pub use roster::{Roster, SearchResult, SyncSummary};
pub use routes::{router, AppState};

/// Runs the HTTP server until ctrl-c (or SIGTERM), then stops all backends.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let manager = Arc::new(PkgManager::new(&config)?);
    if config.sync_on_start {
        if let Err(err) = manager.sync().await {
            warn!(error = %format!("{err:#}"), "initial roster sync failed");
        }
    }
    manager.start().await;

    let state = AppState::new(
        Arc::clone(&manager),
        TokenAuth::new(&config.auth.tokens),
        config.operation_timeout(),
    );
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed binding {}", config.listen))?;
    info!(listen = %config.listen, "serving package manager");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed");
    manager.stop().await;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed listening for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed listening for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests;
