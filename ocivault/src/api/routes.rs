//! Router assembly and the listing endpoints of the v2 API.
//!
//! Repository names may contain slashes, which axum's segment matching
//! cannot express; everything below `/v2/` funnels through a wildcard
//! route and a small path parser that peels the operation suffix off the
//! repository name.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tracing::{info, instrument};

use crate::error::{AppError, Result};
use crate::registry::is_valid_name;
use crate::token::ScopeKind;
use crate::AppState;

use super::models::{paginate, link_header, CatalogResponse, PaginationQuery, TagsListResponse};
use super::{auth, blobs, manifests, signatures};
use super::{API_VERSION, API_VERSION_HEADER, SIGNATURES_HEADER};

/// Create the main router for the registry API.
pub fn registry_router(state: AppState) -> Router {
    Router::new()
        // API version check
        .route("/v2/", get(api_version_check))
        .route("/v2", get(api_version_check))
        // Catalog
        .route("/v2/_catalog", get(list_repositories))
        // Token endpoint
        .route("/token", get(auth::token_handler))
        .route("/token/", get(auth::token_handler))
        // Everything with a repository name in it
        .route("/v2/{*path}", any(v2_dispatch))
        .route("/extensions/v2/{*path}", any(extensions_dispatch))
        .with_state(state)
}

pub fn base_headers(headers: &mut HeaderMap) {
    headers.insert(API_VERSION_HEADER, API_VERSION.parse().unwrap());
    headers.insert(SIGNATURES_HEADER, "1".parse().unwrap());
}

/// Minimal query-string parser; registry query values never rely on
/// percent-encoding beyond `%2F` and `%3A`.
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = value.replace("%2F", "/").replace("%3A", ":");
        params.insert(key.to_string(), value);
    }
    params
}

fn pagination_from(params: &HashMap<String, String>) -> PaginationQuery {
    PaginationQuery {
        n: params.get("n").and_then(|v| v.parse().ok()),
        last: params.get("last").cloned(),
    }
}

// API version check
#[instrument(name = "api_version_check", skip_all)]
async fn api_version_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    state.metrics.request_counter.add(1, &[]);

    let identity = auth::authenticate(&state, &headers)?;
    if !state.config.token.auth_disabled && identity.claims.is_none() {
        return Err(AppError::unauthorized_with_challenge(
            "authentication required",
            auth::challenge(&state, None),
        ));
    }

    let mut response = Json(serde_json::json!({})).into_response();
    base_headers(response.headers_mut());
    Ok(response)
}

// Catalog
#[instrument(name = "list_repositories", skip_all)]
async fn list_repositories(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: axum::http::Uri,
) -> Result<Response> {
    state.metrics.request_counter.add(1, &[]);

    let identity = auth::authenticate(&state, &headers)?;
    if !state.config.token.auth_disabled {
        let permitted = identity
            .claims
            .as_ref()
            .map(|claims| claims.permits(ScopeKind::Registry, "catalog", "*"))
            .unwrap_or(false);
        if !permitted {
            // Anonymous callers get a challenge; insufficient tokens a 401
            // with the catalog scope, per the registry auth flow.
            return Err(AppError::unauthorized_with_challenge(
                "insufficient scope",
                auth::challenge(&state, Some("registry:catalog:*")),
            ));
        }
    }

    // Only repositories the caller could pull from are listed. The check
    // runs against the caller's evaluated permissions, not the token's
    // access entries; a catalog-scoped token names no repositories.
    let mut visible = Vec::new();
    for path in state.registry.catalog().await {
        let target = state
            .registry
            .distribution(&path)
            .await
            .map(|distribution| crate::token::ScopeTarget {
                exists: true,
                private: distribution.private,
            });
        if state
            .tokens
            .has_pull_permission(identity.user.as_deref(), &path, target.as_ref())
        {
            visible.push(path);
        }
    }

    let params = parse_query(uri.query());
    let (repositories, next) = paginate(visible, &pagination_from(&params), "/v2/_catalog");
    info!(count = repositories.len(), "serving catalog");

    let mut response = Json(CatalogResponse { repositories }).into_response();
    base_headers(response.headers_mut());
    if let Some(next) = next {
        response
            .headers_mut()
            .insert(header::LINK, link_header(&next).parse().unwrap());
    }
    Ok(response)
}

// Tags list
#[instrument(name = "list_tags", skip_all, fields(repository = %name))]
async fn list_tags(
    state: AppState,
    identity: auth::Identity,
    name: String,
    params: HashMap<String, String>,
) -> Result<Response> {
    let (_, _, version) = state.registry.resolve(&name).await?;
    auth::require_pull(&state, &identity, &name).await?;

    let (tags, next) = paginate(
        version.tag_names(),
        &pagination_from(&params),
        &format!("/v2/{name}/tags/list"),
    );

    let mut response = Json(TagsListResponse { name, tags }).into_response();
    base_headers(response.headers_mut());
    if let Some(next) = next {
        response
            .headers_mut()
            .insert(header::LINK, link_header(&next).parse().unwrap());
    }
    Ok(response)
}

/// Operation addressed by a `/v2/{name}/…` path.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    TagsList { name: String },
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    UploadStart { name: String },
    Upload { name: String, uuid: String },
}

/// Split a wildcard-captured path into repository name and operation.
fn parse_v2_path(path: &str) -> Result<Route> {
    let trimmed = path.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    let n = segments.len();

    let route = if n >= 3 && segments[n - 2] == "tags" && segments[n - 1] == "list" {
        Route::TagsList {
            name: segments[..n - 2].join("/"),
        }
    } else if n >= 3 && segments[n - 2] == "manifests" {
        Route::Manifest {
            name: segments[..n - 2].join("/"),
            reference: segments[n - 1].to_string(),
        }
    } else if n >= 3 && segments[n - 2] == "blobs" && segments[n - 1] == "uploads" {
        Route::UploadStart {
            name: segments[..n - 2].join("/"),
        }
    } else if n >= 4 && segments[n - 3] == "blobs" && segments[n - 2] == "uploads" {
        Route::Upload {
            name: segments[..n - 3].join("/"),
            uuid: segments[n - 1].to_string(),
        }
    } else if n >= 3 && segments[n - 2] == "blobs" {
        Route::Blob {
            name: segments[..n - 2].join("/"),
            digest: segments[n - 1].to_string(),
        }
    } else {
        return Err(AppError::RepositoryNotFound(path.to_string()));
    };

    let name = match &route {
        Route::TagsList { name }
        | Route::Manifest { name, .. }
        | Route::Blob { name, .. }
        | Route::UploadStart { name }
        | Route::Upload { name, .. } => name,
    };
    if !is_valid_name(name) {
        return Err(AppError::RepositoryInvalid(name.clone()));
    }
    Ok(route)
}

async fn v2_dispatch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request<Body>,
) -> Result<Response> {
    state.metrics.request_counter.add(1, &[]);

    let method = request.method().clone();
    let headers = request.headers().clone();
    let params = parse_query(request.uri().query());

    let identity = auth::authenticate(&state, &headers)?;
    let route = parse_v2_path(&path)?;

    match (route, method.as_str()) {
        (Route::TagsList { name }, "GET") => list_tags(state, identity, name, params).await,
        (Route::Manifest { name, reference }, "GET") => {
            manifests::get_manifest(state, identity, name, reference, headers, false).await
        }
        (Route::Manifest { name, reference }, "HEAD") => {
            manifests::get_manifest(state, identity, name, reference, headers, true).await
        }
        (Route::Manifest { name, reference }, "PUT") => {
            let body = body_bytes(&state, request).await?;
            manifests::put_manifest(state, identity, name, reference, headers, body).await
        }
        (Route::Manifest { name, reference }, "DELETE") => {
            manifests::delete_manifest(state, identity, name, reference).await
        }
        (Route::Blob { name, digest }, "GET") => {
            blobs::get_blob(state, identity, name, digest, false).await
        }
        (Route::Blob { name, digest }, "HEAD") => {
            blobs::get_blob(state, identity, name, digest, true).await
        }
        (Route::UploadStart { name }, "POST") => {
            let body = body_bytes(&state, request).await?;
            blobs::start_upload(state, identity, name, params, body).await
        }
        (Route::Upload { name, uuid }, "PATCH") => {
            let body = body_bytes(&state, request).await?;
            blobs::upload_chunk(state, identity, name, uuid, headers, body).await
        }
        (Route::Upload { name, uuid }, "PUT") => {
            let body = body_bytes(&state, request).await?;
            blobs::complete_upload(state, identity, name, uuid, params, body).await
        }
        (Route::Upload { name, uuid }, "GET") => {
            blobs::upload_status(state, identity, name, uuid).await
        }
        (Route::Upload { name, uuid }, "DELETE") => {
            blobs::cancel_upload(state, identity, name, uuid).await
        }
        (_, method) => Err(AppError::Unsupported(format!(
            "{method} is not supported on this resource"
        ))),
    }
}

async fn extensions_dispatch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request<Body>,
) -> Result<Response> {
    state.metrics.request_counter.add(1, &[]);

    let method = request.method().clone();
    let headers = request.headers().clone();
    let identity = auth::authenticate(&state, &headers)?;

    // The only extension surface is `{name}/signatures/{digest}`.
    let trimmed = path.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    let n = segments.len();
    if n < 3 || segments[n - 2] != "signatures" {
        return Err(AppError::RepositoryNotFound(path.to_string()));
    }
    let name = segments[..n - 2].join("/");
    let digest = segments[n - 1].to_string();
    if !is_valid_name(&name) {
        return Err(AppError::RepositoryInvalid(name));
    }

    match method.as_str() {
        "GET" => signatures::get_signatures(state, identity, name, digest).await,
        "PUT" => {
            let body = body_bytes(&state, request).await?;
            signatures::put_signature(state, identity, name, digest, body).await
        }
        method => Err(AppError::Unsupported(format!(
            "{method} is not supported on signatures"
        ))),
    }
}

async fn body_bytes(state: &AppState, request: Request<Body>) -> Result<bytes::Bytes> {
    // Bound request bodies to the blob chunk cap; manifests are far
    // smaller and re-checked against the payload limit.
    let limit = state.config.registry.chunk_max_bytes;
    axum::body::to_bytes(request.into_body(), limit)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))
}

/// Build an empty-body response with the registry base headers.
pub fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    base_headers(response.headers_mut());
    response
}
