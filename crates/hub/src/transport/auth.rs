// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token verification for HTTP and WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, HandlerError};
use crate::manager::Identity;
use crate::message::Role;
use crate::state::AppState;

/// Verifies a bearer token and yields the caller's identity.
pub trait Authenticator: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Option<Identity>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    role: String,
    /// Expiry as unix seconds. Absent means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Compact HMAC-SHA256 tokens: `base64url(claims).base64url(signature)`.
pub struct HmacAuthenticator {
    key: hmac::Key,
}

impl HmacAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self { key: hmac::Key::new(hmac::HMAC_SHA256, secret) }
    }

    /// Mint a token for `user_id`. `ttl` of `None` never expires.
    pub fn issue(
        &self,
        user_id: &str,
        role: &Role,
        ttl: Option<Duration>,
    ) -> anyhow::Result<String> {
        let exp = ttl.map(|ttl| chrono::Utc::now().timestamp() + ttl.as_secs() as i64);
        let claims = Claims { sub: user_id.to_owned(), role: role.as_str().to_owned(), exp };
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let tag = hmac::sign(&self.key, body.as_bytes());
        Ok(format!("{body}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }
}

impl Authenticator for HmacAuthenticator {
    fn verify(&self, token: &str) -> Option<Identity> {
        let (body, sig) = token.split_once('.')?;
        let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;
        // Constant-time comparison.
        hmac::verify(&self.key, body.as_bytes(), &sig).ok()?;

        let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).ok()?).ok()?;
        if claims.sub.is_empty() {
            return None;
        }
        if claims.exp.is_some_and(|exp| exp <= chrono::Utc::now().timestamp()) {
            return None;
        }
        Some(Identity { user_id: claims.sub, role: Role::parse(&claims.role) })
    }
}

/// Extract a Bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())?.strip_prefix("Bearer ")
}

/// Extract `token=...` from a raw query string.
pub fn query_token(query: Option<&str>) -> Option<&str> {
    query?.split('&').find_map(|pair| pair.strip_prefix("token=")).filter(|t| !t.is_empty())
}

/// Resolve the caller from the query token or the Bearer header.
pub fn authenticate(
    auth: &dyn Authenticator,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Identity, ErrorCode> {
    let token =
        query_token(query).or_else(|| bearer_token(headers)).ok_or(ErrorCode::Unauthorized)?;
    auth.verify(token).ok_or(ErrorCode::Unauthorized)
}

pub fn require_admin(identity: &Identity) -> Result<(), HandlerError> {
    if identity.role == Role::Admin {
        Ok(())
    } else {
        Err(HandlerError::forbidden("admin role required"))
    }
}

/// Axum middleware that authenticates every request and stores the
/// [`Identity`] as a request extension.
///
/// Exempt: `/ws/health`, and `/ws/connect` (authenticated in the upgrade
/// handler so a rejection never upgrades).
pub async fn auth_layer(
    state: State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/ws/health" || path == "/ws/connect" {
        return next.run(req).await;
    }

    match authenticate(state.authenticator.as_ref(), req.headers(), req.uri().query()) {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(code) => code.to_http_response("unauthorized").into_response(),
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
