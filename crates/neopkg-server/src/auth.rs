use std::collections::HashMap;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::routes::{failure, AppState};
use crate::AuthToken;

/// Subject that may call the administrative routes.
pub const ADMIN_SUBJECT: &str = "sys";

/// Identity attached to a request by [`attach_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub subject: String,
}

impl Claim {
    pub fn is_admin(&self) -> bool {
        self.subject.eq_ignore_ascii_case(ADMIN_SUBJECT)
    }
}

/// Bearer tokens known to the server, keyed by their SHA-256 digest.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    subjects: HashMap<String, String>,
}

impl TokenAuth {
    pub fn new(tokens: &[AuthToken]) -> Self {
        Self {
            subjects: tokens
                .iter()
                .map(|token| (token.sha256.to_ascii_lowercase(), token.subject.clone()))
                .collect(),
        }
    }

    pub fn digest(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    pub fn claim_for(&self, token: &str) -> Option<Claim> {
        self.subjects
            .get(&Self::digest(token))
            .map(|subject| Claim {
                subject: subject.clone(),
            })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|token| !token.is_empty())
}

/// Resolves the bearer token, if any, into a [`Claim`] request extension.
pub async fn attach_claim(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if let Some(token) = bearer_token(request.headers()) {
        match state.auth.claim_for(token) {
            Some(claim) => {
                request.extensions_mut().insert(claim);
            }
            None => debug!(path = %request.uri().path(), "unknown bearer token"),
        }
    }
    next.run(request).await
}

/// Rejects requests without an administrator claim.
pub async fn require_admin(request: Request, next: Next) -> Response {
    let allowed = request
        .extensions()
        .get::<Claim>()
        .is_some_and(Claim::is_admin);
    if !allowed {
        return failure(StatusCode::UNAUTHORIZED, "unauthorized", None, None);
    }
    next.run(request).await
}
