use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use neopkg_backend::BackendStatus;
use neopkg_core::{PackageCache, PkgError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::{attach_claim, require_admin};
use crate::static_files::{read_file, write_file, StaticFile};
use crate::{PkgManager, ProcessAction, TokenAuth};

const STORAGE_PREFIX: &str = "/_storage/";
const MAX_STORAGE_BODY: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PkgManager>,
    pub auth: Arc<TokenAuth>,
    pub operation_timeout: Duration,
}

impl AppState {
    pub fn new(manager: Arc<PkgManager>, auth: TokenAuth, operation_timeout: Duration) -> Self {
        Self {
            manager,
            auth: Arc::new(auth),
            operation_timeout,
        }
    }
}

/// `/search` and `/apps/..` are public; everything else needs the `sys` claim.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/sync", get(sync))
        .route("/update", get(sync))
        .route("/install/{name}", get(install))
        .route("/uninstall/{name}", get(uninstall))
        .route("/process/{name}/{action}", get(process))
        .route(
            "/storage/{name}/{*path}",
            get(read_storage_admin).post(write_storage_admin),
        )
        .route_layer(middleware::from_fn(require_admin));

    Router::new()
        .route("/search", get(search))
        .route("/apps/{name}/", any(app_index))
        .route("/apps/{name}/{*path}", any(app_path))
        .merge(admin)
        .layer(middleware::from_fn_with_state(state.clone(), attach_claim))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    reason: String,
    elapse: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct InstallData {
    info: PackageCache,
    log: String,
}

#[derive(Debug, Serialize)]
struct ProcessData {
    status: BackendStatus,
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    #[serde(default)]
    name: String,
    #[serde(default)]
    possibles: Option<String>,
}

fn elapse(started: Option<Instant>) -> String {
    started
        .map(|started| format!("{:?}", started.elapsed()))
        .unwrap_or_else(|| "0s".to_string())
}

pub(crate) fn success<T: Serialize>(started: Instant, data: Option<T>) -> Response {
    Json(Envelope {
        success: true,
        reason: "success".to_string(),
        elapse: elapse(Some(started)),
        data,
    })
    .into_response()
}

pub(crate) fn failure(
    status: StatusCode,
    reason: impl Into<String>,
    started: Option<Instant>,
    data: Option<Value>,
) -> Response {
    let envelope = Envelope {
        success: false,
        reason: reason.into(),
        elapse: elapse(started),
        data,
    };
    (status, Json(envelope)).into_response()
}

fn error_status(err: &anyhow::Error) -> StatusCode {
    for cause in err.chain() {
        if let Some(kind) = cause.downcast_ref::<PkgError>() {
            return match kind {
                PkgError::NotFound(_) | PkgError::NotInstalled(_) => StatusCode::NOT_FOUND,
                PkgError::PathEscape(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return StatusCode::GATEWAY_TIMEOUT;
        }
    }
    StatusCode::INTERNAL_SERVER_ERROR
}

fn error_response(err: &anyhow::Error, started: Instant, data: Option<Value>) -> Response {
    let status = error_status(err);
    warn!(status = status.as_u16(), error = %format!("{err:#}"), "request failed");
    failure(status, format!("{err:#}"), Some(started), data)
}

async fn with_timeout<T, F>(limit: Duration, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, future)
        .await
        .with_context(|| format!("{operation} timed out after {}s", limit.as_secs()))?
}

fn file_response(file: StaticFile) -> Response {
    (
        [(header::CONTENT_TYPE, file.content_type.to_string())],
        file.bytes,
    )
        .into_response()
}

async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let started = Instant::now();
    let possibles = params
        .possibles
        .as_deref()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let name = params.name.trim();
    match with_timeout(
        state.operation_timeout,
        "search",
        state.manager.search(name, possibles),
    )
    .await
    {
        Ok(result) => success(started, Some(result)),
        Err(err) => error_response(&err, started, None),
    }
}

async fn sync(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    match with_timeout(state.operation_timeout, "sync", state.manager.sync()).await {
        Ok(summaries) => success(started, Some(summaries)),
        Err(err) => error_response(&err, started, None),
    }
}

async fn install(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let started = Instant::now();
    let mut log = Vec::new();
    let result = with_timeout(
        state.operation_timeout,
        "install",
        state.manager.install(&name, &mut log),
    )
    .await;
    let log = String::from_utf8_lossy(&log).into_owned();
    match result {
        Ok(info) => success(started, Some(InstallData { info, log })),
        Err(err) => error_response(&err, started, Some(json!({ "log": log }))),
    }
}

async fn uninstall(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let started = Instant::now();
    let mut log = Vec::new();
    let result = with_timeout(
        state.operation_timeout,
        "uninstall",
        state.manager.uninstall(&name, &mut log),
    )
    .await;
    let log = json!({ "log": String::from_utf8_lossy(&log) });
    match result {
        Ok(()) => success(started, Some(log)),
        Err(err) => error_response(&err, started, Some(log)),
    }
}

async fn process(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> Response {
    let started = Instant::now();
    let action = match action.parse::<ProcessAction>() {
        Ok(action) => action,
        Err(err) => return failure(StatusCode::BAD_REQUEST, format!("{err:#}"), Some(started), None),
    };
    match with_timeout(
        state.operation_timeout,
        "process",
        state.manager.process(&name, action),
    )
    .await
    {
        Ok(status) => success(started, Some(ProcessData { status })),
        Err(err) => error_response(&err, started, None),
    }
}

async fn read_storage_admin(
    State(state): State<AppState>,
    Path((name, path)): Path<(String, String)>,
) -> Response {
    read_storage(&state, &name, &path, true).await
}

async fn write_storage_admin(
    State(state): State<AppState>,
    Path((name, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    write_storage(&state, &name, &path, true, request).await
}

async fn app_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    serve_app(state, name, String::new(), request).await
}

async fn app_path(
    State(state): State<AppState>,
    Path((name, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    serve_app(state, name, path, request).await
}

/// Backend proxy first, then the package storage, then the installed tree.
async fn serve_app(state: AppState, name: String, path: String, request: Request) -> Response {
    let started = Instant::now();
    let sub_path = format!("/{path}");
    if let Some(backend) = state.manager.backend(&name).await {
        if backend.should_proxy(&sub_path).await {
            return backend.handle(request).await;
        }
    }

    let method = request.method().clone();
    if let Some(storage_path) = sub_path.strip_prefix(STORAGE_PREFIX) {
        if method == Method::GET {
            return read_storage(&state, &name, storage_path, false).await;
        }
        if method == Method::POST {
            return write_storage(&state, &name, storage_path, false, request).await;
        }
        return failure(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
            Some(started),
            None,
        );
    }
    if method != Method::GET && method != Method::HEAD {
        return failure(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
            Some(started),
            None,
        );
    }

    let current = match state.manager.roster().installed_version(&name) {
        Ok(Some(current)) => current,
        Ok(None) => {
            return failure(
                StatusCode::NOT_FOUND,
                format!("package '{name}' not found"),
                Some(started),
                None,
            )
        }
        Err(err) => return error_response(&err, started, None),
    };
    match read_file(&current.target_dir, &path, false, true).await {
        Ok(Some(file)) => file_response(file),
        Ok(None) => failure(StatusCode::NOT_FOUND, "not found", Some(started), None),
        Err(err) => error_response(&err, started, None),
    }
}

fn storage_root(state: &AppState, name: &str) -> Result<PathBuf> {
    let roster = state.manager.roster();
    roster
        .installed_version(name)?
        .ok_or_else(|| PkgError::NotInstalled(name.to_string()))?;
    Ok(roster.layout().storage_dir(name))
}

async fn read_storage(state: &AppState, name: &str, path: &str, allow_hidden: bool) -> Response {
    let started = Instant::now();
    let root = match storage_root(state, name) {
        Ok(root) => root,
        Err(err) => return error_response(&err, started, None),
    };
    match read_file(&root, path, allow_hidden, false).await {
        Ok(Some(file)) => file_response(file),
        Ok(None) => failure(StatusCode::NOT_FOUND, "not found", Some(started), None),
        Err(err) => error_response(&err, started, None),
    }
}

async fn write_storage(
    state: &AppState,
    name: &str,
    path: &str,
    allow_hidden: bool,
    request: Request,
) -> Response {
    let started = Instant::now();
    let root = match storage_root(state, name) {
        Ok(root) => root,
        Err(err) => return error_response(&err, started, None),
    };
    let body: Bytes = match axum::body::to_bytes(request.into_body(), MAX_STORAGE_BODY).await {
        Ok(body) => body,
        Err(err) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("failed reading request body: {err}"),
                Some(started),
                None,
            )
        }
    };
    match write_file(&root, path, allow_hidden, &body).await {
        Ok(Some(_)) => success::<()>(started, None),
        Ok(None) => failure(StatusCode::NOT_FOUND, "not found", Some(started), None),
        Err(err) => error_response(&err, started, None),
    }
}
