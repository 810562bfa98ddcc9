//! Blob endpoints: content serving (direct or presigned redirect) and the
//! chunked/monolithic upload state machine with cross-repository mounts.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use regex::Regex;
use tracing::{info, instrument, warn};

use ociclient::{DigestAlgorithm, OciDigest};

use crate::error::{AppError, Result};
use crate::repo::{self, ContentRef};
use crate::sync;
use crate::AppState;

use super::routes::{base_headers, empty_response};
use super::{auth, CONTENT_DIGEST_HEADER, UPLOAD_UUID_HEADER};

const PRESIGN_TTL: Duration = Duration::from_secs(600);

fn content_range_pattern() -> Regex {
    Regex::new(r"^([0-9]+)-([0-9]+)$").unwrap()
}

fn parse_digest(raw: &str) -> Result<OciDigest> {
    OciDigest::from_str(raw).map_err(|e| AppError::DigestInvalid(e.to_string()))
}

fn extra_algorithms(state: &AppState) -> Vec<DigestAlgorithm> {
    state
        .config
        .registry
        .extra_digest_algorithms
        .iter()
        .filter_map(|name| DigestAlgorithm::from_str(name).ok())
        .collect()
}

/// The inclusive range header for an upload of `size` bytes.
fn upload_range(size: u64) -> String {
    if size == 0 {
        "0-0".to_string()
    } else {
        format!("0-{}", size - 1)
    }
}

fn upload_response(name: &str, uuid: &str, size: u64, status: StatusCode) -> Response {
    let mut response = empty_response(status);
    let headers = response.headers_mut();
    headers.insert(
        header::LOCATION,
        format!("/v2/{name}/blobs/uploads/{uuid}").parse().unwrap(),
    );
    headers.insert(header::RANGE, upload_range(size).parse().unwrap());
    headers.insert(UPLOAD_UUID_HEADER, uuid.parse().unwrap());
    headers.insert(header::CONTENT_LENGTH, 0.into());
    response
}

#[instrument(name = "get_blob", skip(state, identity), fields(repository = %name, digest = %digest))]
pub async fn get_blob(
    state: AppState,
    identity: auth::Identity,
    name: String,
    digest: String,
    is_head: bool,
) -> Result<Response> {
    let (_, repository, version) = state.registry.resolve(&name).await?;
    auth::require_pull(&state, &identity, &name).await?;

    let digest = parse_digest(&digest)?;
    let row = state.registry.graph.blob(&digest).await;
    let known =
        version.contains_blob(&digest) || repository.pending_blobs.contains(&digest);
    // An alternate-algorithm digest resolves through the graph even though
    // the version references the primary.
    let primary = match (&row, known) {
        (Some(row), _)
            if version.contains_blob(&row.digest)
                || repository.pending_blobs.contains(&row.digest) =>
        {
            row.digest.clone()
        }
        (_, true) => digest.clone(),
        _ => return Err(AppError::BlobNotFound(digest.to_string())),
    };

    if !state.store.exists(&primary).await? {
        // Deferred by an on_demand or streamed sync policy.
        let bytes = sync::fetch_remote_blob(&state, &primary).await?;
        return Ok(blob_bytes_response(&state, &primary, bytes, is_head));
    }

    // Redirect to a presigned URL when the backend offers one; the URL is
    // passed through untouched.
    if let Some(url) = state.store.presign(&primary, PRESIGN_TTL).await {
        let mut response = empty_response(StatusCode::FOUND);
        response
            .headers_mut()
            .insert(header::LOCATION, url.parse().map_err(|_| {
                AppError::Internal("presigned URL is not a valid header value".to_string())
            })?);
        response
            .headers_mut()
            .insert(CONTENT_DIGEST_HEADER, primary.to_string().parse().unwrap());
        return Ok(response);
    }

    let bytes = state.store.read(&primary).await?;
    Ok(blob_bytes_response(&state, &primary, bytes, is_head))
}

fn blob_bytes_response(
    state: &AppState,
    digest: &OciDigest,
    bytes: Bytes,
    is_head: bool,
) -> Response {
    state
        .metrics
        .blob_size_histogram
        .record(bytes.len() as f64, &[]);
    let length = bytes.len();
    let mut response = Response::new(if is_head {
        Body::empty()
    } else {
        Body::from(bytes)
    });
    let headers = response.headers_mut();
    base_headers(headers);
    headers.insert(
        header::CONTENT_TYPE,
        ociclient::media_type::OCTET_STREAM.parse().unwrap(),
    );
    headers.insert(header::CONTENT_LENGTH, length.into());
    headers.insert(CONTENT_DIGEST_HEADER, digest.to_string().parse().unwrap());
    response
}

/// POST `/v2/{name}/blobs/uploads/`: open an upload, mount a blob from
/// another repository, or complete a monolithic single-request upload.
#[instrument(name = "start_upload", skip(state, identity, params, body), fields(repository = %name))]
pub async fn start_upload(
    state: AppState,
    identity: auth::Identity,
    name: String,
    params: HashMap<String, String>,
    body: Bytes,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    state
        .registry
        .create_push_repository(&name, identity.user.as_deref())
        .await?;

    if let (Some(mount), Some(from)) = (params.get("mount"), params.get("from")) {
        match mount_blob(&state, &identity, &name, mount, from).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                // An unauthorized or missing source falls through to a
                // regular upload, per the distribution spec.
                info!("blob mount failed, falling back to upload: {err}");
            }
        }
    }

    if let Some(digest) = params.get("digest") {
        return single_request_upload(&state, &name, digest, body).await;
    }

    let upload = state.registry.create_upload(&name).await;
    info!(uuid = %upload.uuid, "upload started");
    Ok(upload_response(&name, &upload.uuid, 0, StatusCode::ACCEPTED))
}

async fn mount_blob(
    state: &AppState,
    identity: &auth::Identity,
    name: &str,
    mount: &str,
    from: &str,
) -> Result<Response> {
    auth::require_pull(state, identity, from).await?;
    let (_, _, source_version) = state.registry.resolve(from).await?;
    let digest = parse_digest(mount)?;
    if !source_version.contains_blob(&digest) {
        return Err(AppError::BlobNotFound(digest.to_string()));
    }

    let refs = vec![ContentRef::Blob(digest.clone())];
    let resource = format!("repository:{name}");
    let guards = state.tasks.try_reserve(&[resource]).await?;
    let manifests = state.registry.graph.manifest_table().await;
    state
        .registry
        .update_repository(name, |repo| {
            let content = repo::recursive_add(repo.latest(), &refs, &manifests);
            repo.commit(content)
        })
        .await?;
    drop(guards);

    state.registry.persist().await;
    info!(%digest, %from, "mounted blob across repositories");

    let mut response = empty_response(StatusCode::CREATED);
    let headers = response.headers_mut();
    headers.insert(
        header::LOCATION,
        format!("/v2/{name}/blobs/{digest}").parse().unwrap(),
    );
    headers.insert(CONTENT_DIGEST_HEADER, digest.to_string().parse().unwrap());
    headers.insert(header::CONTENT_LENGTH, 0.into());
    Ok(response)
}

async fn single_request_upload(
    state: &AppState,
    name: &str,
    digest: &str,
    body: Bytes,
) -> Result<Response> {
    let expected = parse_digest(digest)?;
    let (computed, alternates) = state
        .store
        .put_bytes(body.clone(), &extra_algorithms(state))
        .await?;
    if computed != expected {
        return Err(AppError::DigestInvalid(format!(
            "body hashed to {computed}, not {expected}"
        )));
    }
    commit_blob(state, name, computed.clone(), body.len() as u64, alternates).await?;

    let mut response = empty_response(StatusCode::CREATED);
    let headers = response.headers_mut();
    headers.insert(
        header::LOCATION,
        format!("/v2/{name}/blobs/{computed}").parse().unwrap(),
    );
    headers.insert(CONTENT_DIGEST_HEADER, computed.to_string().parse().unwrap());
    headers.insert(header::CONTENT_LENGTH, 0.into());
    Ok(response)
}

/// Record the blob row and commit it into a new repository version under
/// the repository's reservation. A busy reservation surfaces as 429.
async fn commit_blob(
    state: &AppState,
    name: &str,
    digest: OciDigest,
    size: u64,
    alternates: Vec<OciDigest>,
) -> Result<u64> {
    state.registry.graph.ensure_blob(digest.clone(), size).await;
    for alternate in alternates {
        state
            .registry
            .graph
            .record_alternate(alternate, digest.clone())
            .await;
    }

    let resource = format!("repository:{name}");
    let guards = state.tasks.try_reserve(&[resource]).await?;
    let refs = vec![ContentRef::Blob(digest)];
    let manifests = state.registry.graph.manifest_table().await;
    let version = state
        .registry
        .update_repository(name, |repo| {
            let content = repo::recursive_add(repo.latest(), &refs, &manifests);
            let version = repo.commit(content);
            if let ContentRef::Blob(digest) = &refs[0] {
                repo.pending_blobs.insert(digest.clone());
            }
            version
        })
        .await?;
    drop(guards);

    state.registry.persist().await;
    Ok(version)
}

#[instrument(name = "upload_chunk", skip(state, identity, headers, body), fields(repository = %name, uuid = %uuid, size = body.len()))]
pub async fn upload_chunk(
    state: AppState,
    identity: auth::Identity,
    name: String,
    uuid: String,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    let upload = state
        .registry
        .upload(&uuid)
        .await
        .filter(|u| u.repository == name)
        .ok_or_else(|| AppError::UploadNotFound(uuid.clone()))?;

    let (start, length) = match headers.get("Content-Range").and_then(|v| v.to_str().ok()) {
        Some(range) => {
            let captures = content_range_pattern()
                .captures(range)
                .ok_or_else(|| AppError::BadRequest(format!("invalid range header {range}")))?;
            let start: u64 = captures[1].parse().unwrap();
            let end: u64 = captures[2].parse().unwrap();
            if end < start {
                return Err(AppError::BadRequest(format!("invalid range header {range}")));
            }
            (start, end - start + 1)
        }
        // Some clients send a single rangeless PATCH carrying the whole
        // blob; it lands at the current offset.
        None => (upload.size, body.len() as u64),
    };

    if start != upload.size {
        warn!(start, expected = upload.size, "discontiguous chunk");
        return Err(AppError::RangeInvalid {
            offset: upload.size,
        });
    }
    if let Some(declared) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if declared != body.len() as u64 {
            return Err(AppError::BadRequest(format!(
                "Content-Length {declared} does not match the chunk size {}",
                body.len()
            )));
        }
    }
    if body.len() as u64 != length {
        return Err(AppError::BadRequest(format!(
            "range describes {length} bytes but the chunk carries {}",
            body.len()
        )));
    }

    state.store.stage_chunk(&uuid, start, body).await?;
    let size = state
        .registry
        .update_upload(&uuid, |u| {
            u.offsets.push(start);
            u.size += length;
            u.size
        })
        .await?;

    Ok(upload_response(&name, &uuid, size, StatusCode::ACCEPTED))
}

#[instrument(name = "complete_upload", skip(state, identity, params, body), fields(repository = %name, uuid = %uuid))]
pub async fn complete_upload(
    state: AppState,
    identity: auth::Identity,
    name: String,
    uuid: String,
    params: HashMap<String, String>,
    body: Bytes,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    let upload = state
        .registry
        .upload(&uuid)
        .await
        .filter(|u| u.repository == name)
        .ok_or_else(|| AppError::UploadNotFound(uuid.clone()))?;
    let expected = parse_digest(
        params
            .get("digest")
            .ok_or_else(|| AppError::BadRequest("missing digest parameter".to_string()))?,
    )?;

    // The final PUT may carry the last chunk (or, for a monolithic upload,
    // the only one).
    let mut offsets = upload.offsets.clone();
    if !body.is_empty() {
        state.store.stage_chunk(&uuid, upload.size, body.clone()).await?;
        offsets.push(upload.size);
    }

    let (computed, size, alternates) = state
        .store
        .commit_staged(&uuid, &offsets, &extra_algorithms(&state))
        .await?;
    if computed != expected {
        state.store.discard_staged(&uuid).await?;
        state.registry.delete_upload(&uuid).await;
        return Err(AppError::DigestInvalid(format!(
            "upload hashed to {computed}, not {expected}"
        )));
    }

    state
        .metrics
        .blob_size_histogram
        .record(size as f64, &[]);
    commit_blob(&state, &name, computed.clone(), size, alternates).await?;
    state.store.discard_staged(&uuid).await?;
    state.registry.delete_upload(&uuid).await;
    info!(digest = %computed, size, "upload committed");

    let mut response = empty_response(StatusCode::CREATED);
    let headers = response.headers_mut();
    headers.insert(
        header::LOCATION,
        format!("/v2/{name}/blobs/{computed}").parse().unwrap(),
    );
    headers.insert(CONTENT_DIGEST_HEADER, computed.to_string().parse().unwrap());
    headers.insert(header::CONTENT_LENGTH, 0.into());
    Ok(response)
}

#[instrument(name = "upload_status", skip(state, identity), fields(repository = %name, uuid = %uuid))]
pub async fn upload_status(
    state: AppState,
    identity: auth::Identity,
    name: String,
    uuid: String,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    let upload = state
        .registry
        .upload(&uuid)
        .await
        .filter(|u| u.repository == name)
        .ok_or_else(|| AppError::UploadNotFound(uuid.clone()))?;
    Ok(upload_response(
        &name,
        &uuid,
        upload.size,
        StatusCode::NO_CONTENT,
    ))
}

#[instrument(name = "cancel_upload", skip(state, identity), fields(repository = %name, uuid = %uuid))]
pub async fn cancel_upload(
    state: AppState,
    identity: auth::Identity,
    name: String,
    uuid: String,
) -> Result<Response> {
    auth::require_push(&state, &identity, &name).await?;
    state
        .registry
        .delete_upload(&uuid)
        .await
        .filter(|u| u.repository == name)
        .ok_or_else(|| AppError::UploadNotFound(uuid.clone()))?;
    state.store.discard_staged(&uuid).await?;
    info!("upload canceled");
    Ok(empty_response(StatusCode::NO_CONTENT))
}
