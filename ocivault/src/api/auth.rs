//! Request authentication and the token endpoint.
//!
//! With token auth enabled every registry request must carry a Bearer
//! token; requests without one get a `WWW-Authenticate` challenge naming
//! the token endpoint. When it is disabled, Basic credentials or a
//! `Remote-User` header (set by a trusted reverse proxy) identify the
//! caller and permissions are evaluated per request.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, instrument};

use crate::error::{AppError, Result};
use crate::token::{AccessEntry, Claims, Scope, ScopeKind, ScopeTarget};
use crate::AppState;

/// Who is making the request, and what their token grants.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user: Option<String>,
    pub claims: Option<Claims>,
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        self.user.is_none()
    }

    /// Stable fingerprint of this identity's grants, for cache keys.
    pub fn scope_fingerprint(&self) -> String {
        match &self.claims {
            Some(claims) => {
                let mut parts: Vec<String> = claims
                    .access
                    .iter()
                    .map(|e| format!("{}:{}:{}", e.kind, e.name, e.actions.join(",")))
                    .collect();
                parts.sort();
                format!("{}|{}", claims.sub, parts.join(";"))
            }
            None => self.user.clone().unwrap_or_else(|| "anonymous".to_string()),
        }
    }
}

/// The challenge returned alongside 401 responses.
pub fn challenge(state: &AppState, scope: Option<&str>) -> String {
    let realm = state.config.token_realm(&state.external_url);
    let service = state.tokens.service();
    match scope {
        Some(scope) => format!(r#"Bearer realm="{realm}",service="{service}",scope="{scope}""#),
        None => format!(r#"Bearer realm="{realm}",service="{service}""#),
    }
}

fn decode_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, password) = credentials.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Identify the caller of a registry request.
///
/// Failures are only returned for malformed or invalid credentials; a
/// missing Authorization header yields an anonymous identity and the
/// endpoint decides whether that is acceptable.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(|v| {
            v.to_str()
                .map_err(|_| AppError::unauthorized("invalid Authorization header"))
        })
        .transpose()?;

    if state.config.token.auth_disabled {
        // Basic or Remote-User fallback.
        if let Some(value) = authorization {
            if let Some((user, password)) = decode_basic(value) {
                if !state.tokens.check_basic(&user, &password) {
                    return Err(AppError::unauthorized("invalid credentials"));
                }
                return Ok(Identity {
                    user: Some(user),
                    claims: None,
                });
            }
        }
        if let Some(user) = headers.get("Remote-User").and_then(|v| v.to_str().ok()) {
            return Ok(Identity {
                user: Some(user.to_string()),
                claims: None,
            });
        }
        return Ok(Identity::default());
    }

    match authorization {
        Some(value) if value.starts_with("Bearer ") => {
            let claims = state.tokens.verify(&value["Bearer ".len()..])?;
            let user = if claims.sub.is_empty() {
                None
            } else {
                Some(claims.sub.clone())
            };
            Ok(Identity {
                user,
                claims: Some(claims),
            })
        }
        _ => Ok(Identity::default()),
    }
}

/// Look up what the permission evaluator needs to know about a path.
async fn scope_target(state: &AppState, path: &str) -> Option<ScopeTarget> {
    if let Some(distribution) = state.registry.distribution(path).await {
        return Some(ScopeTarget {
            exists: true,
            private: distribution.private,
        });
    }
    // A pull-through distribution stands in for sub-paths it has not
    // cached yet, so pull scope can be granted before the first fetch.
    state
        .registry
        .pull_through_parent(path)
        .await
        .map(|(parent, _)| ScopeTarget {
            exists: true,
            private: parent.private,
        })
}

fn insufficient(state: &AppState, identity: &Identity, scope: String) -> AppError {
    if identity.claims.as_ref().map(|c| c.is_anonymous()).unwrap_or(true) {
        AppError::unauthorized_with_challenge("insufficient scope", challenge(state, Some(&scope)))
    } else {
        AppError::Denied(format!("token does not grant {scope}"))
    }
}

/// Require pull access to a served path.
pub async fn require_pull(state: &AppState, identity: &Identity, path: &str) -> Result<()> {
    if state.config.token.auth_disabled {
        let target = scope_target(state, path).await;
        if state
            .tokens
            .has_pull_permission(identity.user.as_deref(), path, target.as_ref())
        {
            return Ok(());
        }
        return Err(AppError::Denied(format!("pull access to {path} denied")));
    }

    match &identity.claims {
        Some(claims) if claims.permits(ScopeKind::Repository, path, "pull") => Ok(()),
        _ => Err(insufficient(
            state,
            identity,
            format!("repository:{path}:pull"),
        )),
    }
}

/// Require push access to a served path.
pub async fn require_push(state: &AppState, identity: &Identity, path: &str) -> Result<()> {
    if state.config.token.auth_disabled {
        let target = scope_target(state, path).await;
        if state
            .tokens
            .has_push_permission(identity.user.as_deref(), path, target.as_ref())
        {
            return Ok(());
        }
        return Err(AppError::Denied(format!("push access to {path} denied")));
    }

    match &identity.claims {
        Some(claims) if claims.permits(ScopeKind::Repository, path, "push") => Ok(()),
        _ => Err(insufficient(
            state,
            identity,
            format!("repository:{path}:pull,push"),
        )),
    }
}

// Token endpoint

#[derive(Debug, serde::Deserialize)]
pub struct TokenParams {
    pub service: Option<String>,
    pub scope: Option<String>,
    #[allow(dead_code)]
    pub account: Option<String>,
}

/// `GET /token/?service=…&scope=…`: authenticate (optionally) with Basic
/// credentials and issue a token whose access is the intersection of the
/// request and the caller's permissions.
#[instrument(name = "token_handler", skip_all)]
pub async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TokenParams>,
) -> Result<impl IntoResponse> {
    if state.config.token.auth_disabled {
        return Err(AppError::Unsupported(
            "token authentication is disabled".to_string(),
        ));
    }

    let user = match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) if value.starts_with("Basic ") => {
            let (user, password) = decode_basic(value)
                .ok_or_else(|| AppError::unauthorized("invalid Basic auth"))?;
            if !state.tokens.check_basic(&user, &password) {
                return Err(AppError::unauthorized("invalid credentials"));
            }
            Some(user)
        }
        // Anonymous token requests are allowed; they carry whatever public
        // access the scope evaluation grants.
        _ => None,
    };

    let mut access: Vec<AccessEntry> = Vec::new();
    if let Some(raw) = params.scope.as_deref() {
        for scope in Scope::parse_all(raw)? {
            let target = match scope.kind {
                ScopeKind::Repository => scope_target(&state, &scope.name).await,
                ScopeKind::Registry => None,
            };
            access.push(
                state
                    .tokens
                    .evaluate(user.as_deref(), &scope, target.as_ref()),
            );
        }
    }
    debug!(user = ?user, service = ?params.service, "issuing token");

    let reply = state.tokens.issue(user.as_deref(), access)?;
    Ok(Json(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header_decoding() {
        let value = format!("Basic {}", BASE64.encode("alice:wonderland"));
        assert_eq!(
            decode_basic(&value),
            Some(("alice".to_string(), "wonderland".to_string()))
        );
        assert_eq!(decode_basic("Bearer abc"), None);
        assert_eq!(decode_basic("Basic !!!"), None);
    }
}
