//! The signature API extension:
//! `/extensions/v2/{name}/signatures/{digest}`.

use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use tracing::{info, instrument};

use ociclient::OciDigest;

use crate::content::SignatureKind;
use crate::error::{AppError, Result};
use crate::repo::{self, ContentRef, RepositoryKind};
use crate::sign;
use crate::AppState;

use super::models::{SignatureEntry, SignatureListResponse};
use super::routes::{base_headers, empty_response};
use super::auth;

fn parse_digest(raw: &str) -> Result<OciDigest> {
    OciDigest::from_str(raw).map_err(|e| AppError::DigestInvalid(e.to_string()))
}

#[instrument(name = "get_signatures", skip(state, identity), fields(repository = %name, digest = %digest))]
pub async fn get_signatures(
    state: AppState,
    identity: auth::Identity,
    name: String,
    digest: String,
) -> Result<Response> {
    let (_, _, version) = state.registry.resolve(&name).await?;
    auth::require_pull(&state, &identity, &name).await?;

    let digest = parse_digest(&digest)?;
    if !version.contains_manifest(&digest) {
        return Err(AppError::ManifestNotFound(digest.to_string()));
    }

    let signatures = state
        .registry
        .graph
        .signatures_for(&digest)
        .await
        .into_iter()
        .filter(|row| version.contains(&ContentRef::Signature(row.digest.clone())))
        .map(|row| SignatureEntry {
            schema_version: sign::SIGNATURE_SCHEMA_VERSION,
            name: row.name,
            signature_type: match row.kind {
                SignatureKind::Atomic => "atomic".to_string(),
                SignatureKind::Cosign => "cosign".to_string(),
            },
            content: row.data,
        })
        .collect();

    let mut response = Json(SignatureListResponse { signatures }).into_response();
    base_headers(response.headers_mut());
    Ok(response)
}

#[instrument(name = "put_signature", skip(state, identity, body), fields(repository = %name, digest = %digest))]
pub async fn put_signature(
    state: AppState,
    identity: auth::Identity,
    name: String,
    digest: String,
    body: Bytes,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    let (_, repository, version) = state.registry.resolve(&name).await?;
    if repository.kind != RepositoryKind::Push {
        return Err(AppError::Unsupported(
            "sync repositories are read-only over the registry API".to_string(),
        ));
    }

    if body.len() > state.config.registry.payload_max_bytes {
        return Err(AppError::SignatureInvalid(format!(
            "signature exceeds the payload limit of {} bytes",
            state.config.registry.payload_max_bytes
        )));
    }

    let digest = parse_digest(&digest)?;
    if !version.contains_manifest(&digest) {
        return Err(AppError::ManifestNotFound(digest.to_string()));
    }
    sign::validate_payload(&body, &digest)?;

    let row = sign::signature_row(&body, digest.clone(), SignatureKind::Atomic, None);
    let row = state.registry.graph.put_signature(row).await;

    let refs = vec![ContentRef::Signature(row.digest.clone())];
    let resource = format!("repository:{name}");
    state
        .tasks
        .run_reserved("signature-put", vec![resource], async {
            let manifests = state.registry.graph.manifest_table().await;
            state
                .registry
                .update_repository(&name, |repo| {
                    let content = repo::recursive_add(repo.latest(), &refs, &manifests);
                    repo.commit(content)
                })
                .await
        })
        .await?;

    state.registry.persist().await;
    info!(signature = %row.digest, "stored signature");
    Ok(empty_response(StatusCode::CREATED))
}
