//! Manifest endpoints: GET/HEAD with content negotiation and pull-through,
//! PUT with full validation, DELETE via recursive removal.

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tracing::{info, instrument};

use ociclient::{OciDigest, Reference};

use crate::cache::{CachedManifest, ResponseCache};
use crate::content::media_type::{accepted_media_types, determine_media_type, is_manifest_list, is_schema1};
use crate::content::labels_from_config;
use crate::error::{AppError, Result};
use crate::registry::is_valid_tag;
use crate::repo::{self, ContentRef, RepositoryKind};
use crate::sync;
use crate::AppState;

use super::routes::{base_headers, empty_response};
use super::{auth, CONTENT_DIGEST_HEADER};

/// Resolve a path that may be served by a pull-through distribution,
/// creating the local repository on first use.
async fn resolve_or_pull_through(
    state: &AppState,
    identity: &auth::Identity,
    name: &str,
    reference: &Reference,
) -> Result<(crate::registry::Distribution, crate::repo::Repository, crate::repo::RepositoryVersion)>
{
    match state.registry.resolve(name).await {
        Ok(resolved) => Ok(resolved),
        Err(AppError::RepositoryNotFound(_)) => {
            let Some((parent, rest)) = state.registry.pull_through_parent(name).await else {
                return Err(AppError::RepositoryNotFound(name.to_string()));
            };
            // Nothing is cached yet, so this pull causes an upstream fetch;
            // anonymous clients may only read already-cached content.
            if identity.is_anonymous() {
                return Err(AppError::unauthorized_with_challenge(
                    "authentication required for a pull-through fetch",
                    auth::challenge(state, Some(&format!("repository:{name}:pull"))),
                ));
            }
            sync::pull_through(state, &parent, &rest, reference).await?;
            state.registry.resolve(name).await
        }
        Err(err) => Err(err),
    }
}

/// Find the manifest digest a reference names within the served version.
fn resolve_reference(
    version: &crate::repo::RepositoryVersion,
    repository: &crate::repo::Repository,
    reference: &Reference,
) -> Option<OciDigest> {
    match reference {
        Reference::Tag(tag) => version.tag(tag),
        Reference::Digest(digest) => {
            if version.contains_manifest(digest) || repository.pending_manifests.contains(digest) {
                Some(digest.clone())
            } else {
                None
            }
        }
    }
}

#[instrument(name = "get_manifest", skip(state, identity, headers), fields(repository = %name, reference = %reference))]
pub async fn get_manifest(
    state: AppState,
    identity: auth::Identity,
    name: String,
    reference: String,
    headers: HeaderMap,
    is_head: bool,
) -> Result<Response> {
    let parsed = Reference::parse(&reference);
    let (_, mut repository, mut version) =
        resolve_or_pull_through(&state, &identity, &name, &parsed).await?;
    auth::require_pull(&state, &identity, &name).await?;

    let mut digest = resolve_reference(&version, &repository, &parsed);
    if digest.is_none() {
        // A pull-through repository may be serving a tag it has not cached
        // yet; fetch it now, on this request.
        if let Some((parent, rest)) = state.registry.pull_through_parent(&name).await {
            if identity.is_anonymous() {
                return Err(AppError::unauthorized_with_challenge(
                    "authentication required for a pull-through fetch",
                    auth::challenge(&state, Some(&format!("repository:{name}:pull"))),
                ));
            }
            sync::pull_through(&state, &parent, &rest, &parsed).await?;
            let resolved = state.registry.resolve(&name).await?;
            repository = resolved.1;
            version = resolved.2;
            digest = resolve_reference(&version, &repository, &parsed);
        }
    }
    let digest = digest.ok_or_else(|| AppError::ManifestNotFound(reference.clone()))?;

    let row = state
        .registry
        .graph
        .manifest(&digest)
        .await
        .ok_or_else(|| AppError::ManifestNotFound(reference.clone()))?;

    // Content negotiation: no conversion is performed, so a manifest whose
    // stored schema the client does not accept is simply not found.
    let accepted = accepted_media_types(&headers);
    if !accepted.is_empty()
        && !accepted.iter().any(|t| t == "*/*" || t == &row.media_type)
    {
        return Err(AppError::ManifestNotFound(format!(
            "{reference} is not available as any accepted media type"
        )));
    }

    let cache_key = ResponseCache::key(&name, &reference, &identity.scope_fingerprint());
    let cached = if is_head {
        None
    } else {
        state.cache.get(&cache_key).await
    };
    let entry = match cached {
        Some(entry) => entry,
        None => {
            let bytes = state.registry.graph.store().read(&digest).await?;
            let entry = CachedManifest {
                bytes,
                media_type: row.media_type.clone(),
                digest: digest.to_string(),
            };
            if !is_head {
                state.cache.put(cache_key, entry.clone()).await;
            }
            entry
        }
    };

    state
        .metrics
        .blob_size_histogram
        .record(entry.bytes.len() as f64, &[]);

    let mut response = Response::new(if is_head {
        Body::empty()
    } else {
        Body::from(entry.bytes.clone())
    });
    let response_headers = response.headers_mut();
    base_headers(response_headers);
    response_headers.insert(header::CONTENT_TYPE, entry.media_type.parse().unwrap());
    response_headers.insert(header::CONTENT_LENGTH, entry.bytes.len().into());
    response_headers.insert(CONTENT_DIGEST_HEADER, entry.digest.parse().unwrap());
    Ok(response)
}

#[instrument(name = "put_manifest", skip(state, identity, headers, body), fields(repository = %name, reference = %reference, size = body.len()))]
pub async fn put_manifest(
    state: AppState,
    identity: auth::Identity,
    name: String,
    reference: String,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    let repository = state
        .registry
        .create_push_repository(&name, identity.user.as_deref())
        .await?;

    let data: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest JSON: {e}")))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let media_type = determine_media_type(&data, content_type)?;

    if is_schema1(&media_type) {
        // Schema-1 manifests carry no config blob; they are accepted from
        // upstreams during sync but not pushed.
        return Err(AppError::ManifestInvalid(
            "pushing schema-1 manifests is not supported".to_string(),
        ));
    }

    let version = repository.latest();
    let present_blob = |digest: &OciDigest| {
        version.contains_blob(digest) || repository.pending_blobs.contains(digest)
    };
    let present_manifest = |digest: &OciDigest| {
        version.contains_manifest(digest) || repository.pending_manifests.contains(digest)
    };

    // Validate every reference before any row is created.
    let mut config_labels = None;
    if is_manifest_list(&media_type) {
        let index: ociclient::ImageIndex = serde_json::from_slice(&body)
            .map_err(|e| AppError::ManifestInvalid(format!("malformed index: {e}")))?;
        for descriptor in &index.manifests {
            if !present_manifest(&descriptor.digest) {
                return Err(AppError::ManifestInvalid(format!(
                    "listed manifest {} is unknown to this repository",
                    descriptor.digest
                )));
            }
        }
    } else {
        let manifest: ociclient::ImageManifest = serde_json::from_slice(&body)
            .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest: {e}")))?;
        if !present_blob(&manifest.config.digest) {
            return Err(AppError::BlobInvalid(manifest.config.digest.to_string()));
        }
        for layer in &manifest.layers {
            if !present_blob(&layer.digest) {
                return Err(AppError::BlobInvalid(layer.digest.to_string()));
            }
        }
        let config_bytes = state.store.read(&manifest.config.digest).await?;
        config_labels = Some(labels_from_config(&config_bytes));
    }

    let row = state
        .registry
        .graph
        .put_manifest(
            body,
            &media_type,
            &state.media_types,
            state.config.registry.payload_max_bytes,
            config_labels,
        )
        .await?;

    // Tag push vs digest push.
    let refs = match Reference::parse(&reference) {
        Reference::Tag(tag) => {
            if !is_valid_tag(&tag) {
                return Err(AppError::TagInvalid(tag));
            }
            vec![ContentRef::Tag {
                name: tag,
                manifest: row.digest.clone(),
            }]
        }
        Reference::Digest(digest) => {
            if digest != row.digest {
                return Err(AppError::DigestInvalid(format!(
                    "body hashed to {}, not {digest}",
                    row.digest
                )));
            }
            vec![ContentRef::Manifest(digest)]
        }
    };

    let consumed_blobs = row.blob_digests();
    let consumed_manifests: Vec<OciDigest> =
        row.sub_manifests().iter().map(|s| s.digest.clone()).collect();
    let resource = format!("repository:{name}");
    state
        .tasks
        .run_reserved("manifest-put", vec![resource], async {
            let manifests = state.registry.graph.manifest_table().await;
            state
                .registry
                .update_repository(&name, |repo| {
                    let content = repo::recursive_add(repo.latest(), &refs, &manifests);
                    let version = repo.commit(content);
                    if let Some(ContentRef::Manifest(digest)) = refs.first() {
                        // Pushed by digest, ahead of the list that will
                        // reference it.
                        repo.pending_manifests.insert(digest.clone());
                    }
                    for digest in &consumed_blobs {
                        repo.pending_blobs.remove(digest);
                    }
                    for digest in &consumed_manifests {
                        repo.pending_manifests.remove(digest);
                    }
                    version
                })
                .await
        })
        .await?;

    state.registry.persist().await;
    state.cache.invalidate_path(&name).await;
    info!(digest = %row.digest, "stored manifest");

    let mut response = empty_response(StatusCode::CREATED);
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::LOCATION,
        format!("/v2/{}/manifests/{}", name, row.digest).parse().unwrap(),
    );
    response_headers.insert(CONTENT_DIGEST_HEADER, row.digest.to_string().parse().unwrap());
    Ok(response)
}

#[instrument(name = "delete_manifest", skip(state, identity), fields(repository = %name, reference = %reference))]
pub async fn delete_manifest(
    state: AppState,
    identity: auth::Identity,
    name: String,
    reference: String,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    let (_, repository, version) = state.registry.resolve(&name).await?;
    if repository.kind != RepositoryKind::Push {
        return Err(AppError::Unsupported(
            "sync repositories are read-only over the registry API".to_string(),
        ));
    }

    let refs = match Reference::parse(&reference) {
        Reference::Tag(tag) => {
            let manifest = version
                .tag(&tag)
                .ok_or_else(|| AppError::ManifestNotFound(reference.clone()))?;
            vec![ContentRef::Tag {
                name: tag,
                manifest,
            }]
        }
        Reference::Digest(digest) => {
            if !version.contains_manifest(&digest) {
                return Err(AppError::ManifestNotFound(reference.clone()));
            }
            vec![ContentRef::Manifest(digest)]
        }
    };

    let resource = format!("repository:{name}");
    state
        .tasks
        .run_reserved("manifest-delete", vec![resource], async {
            let manifests = state.registry.graph.manifest_table().await;
            let signatures = state.registry.graph.signature_table().await;
            state
                .registry
                .update_repository(&name, |repo| {
                    let content =
                        repo::recursive_remove(repo.latest(), &refs, &manifests, &signatures);
                    repo.commit(content)
                })
                .await
        })
        .await?;

    state.registry.persist().await;
    state.cache.invalidate_path(&name).await;
    Ok(empty_response(StatusCode::ACCEPTED))
}
