//! Upstream synchronization: full repository syncs in mirror or additive
//! mode, and single-image pull-through fetches.
//!
//! Discovery walks the upstream tag list, negotiates a manifest schema per
//! tag, recursively ingests listed manifests and blobs, and picks up
//! signatures from whichever source the remote offers. The new repository
//! version is committed under the repository's reservation.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use ociclient::media_type::*;
use ociclient::{Client, ClientSession, Credentials, OciDigest, Reference};

use crate::content::{labels_from_config, ManifestRow, SignatureKind};
use crate::error::{AppError, Result};
use crate::registry::{Distribution, DownloadPolicy, Remote, RemoteBlobSource};
use crate::repo::{self, ContentRef, RepositoryKind};
use crate::sign;
use crate::App;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only add content found upstream
    Additive,
    /// Additionally remove tags that disappeared upstream
    Mirror,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Skip unsigned manifests (and whole lists containing one)
    pub signed_only: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Additive,
            signed_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub version: u64,
    pub tags_synced: Vec<String>,
    pub tags_removed: Vec<String>,
    pub tags_skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureSource {
    Sigstore,
    ApiExtension,
}

/// Shell-style wildcard match supporting `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Filter a tag list by include patterns, then drop excluded ones.
pub fn filter_tags(tags: &[String], include: &[String], exclude: &[String]) -> Vec<String> {
    let mut filtered: Vec<String> = tags.to_vec();
    if !include.is_empty() {
        filtered.retain(|tag| include.iter().any(|p| wildcard_match(p, tag)));
    }
    if !exclude.is_empty() {
        filtered.retain(|tag| !exclude.iter().any(|p| wildcard_match(p, tag)));
    }
    filtered
}

fn upstream_client(app: &App, remote: &Remote) -> Client {
    let credentials = match (&remote.username, &remote.password) {
        (Some(username), Some(password)) => Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };
    Client::new(remote.url.clone(), credentials).with_max_retries(app.config.sync.max_retries)
}

struct SyncRun<'a> {
    app: &'a App,
    remote: Remote,
    upstream_name: String,
    client: Client,
    session: ClientSession,
    signature_source: Option<SignatureSource>,
    signed_only: bool,
    /// References to hand to the repository engine at the end
    refs: Vec<ContentRef>,
}

impl<'a> SyncRun<'a> {
    async fn new(
        app: &'a App,
        remote: Remote,
        upstream_name: String,
        signed_only: bool,
    ) -> Result<SyncRun<'a>> {
        let client = upstream_client(app, &remote);
        let session = client.new_session(upstream_name.clone());

        let signature_source = if remote.sigstore.is_some() {
            Some(SignatureSource::Sigstore)
        } else if client.supports_signature_extension().await.unwrap_or(false) {
            Some(SignatureSource::ApiExtension)
        } else {
            None
        };
        if signed_only && signature_source.is_none() {
            return Err(AppError::BadRequest(
                "signed-only sync requested but the remote offers no signature source"
                    .to_string(),
            ));
        }

        Ok(SyncRun {
            app,
            remote,
            upstream_name,
            client,
            session,
            signature_source,
            signed_only,
            refs: Vec::new(),
        })
    }

    /// Sync one tag. Returns false when signed-only filtering skipped it.
    async fn sync_tag(&mut self, tag: &str) -> Result<bool> {
        let reference = Reference::Tag(tag.to_string());

        // Skip the body fetch when the advertised digest is already known.
        let head = self.session.head_manifest(&reference).await?;
        let mut known = None;
        if let Some(digest) = head.as_ref().and_then(|h| h.digest.clone()) {
            if let Some(existing) = self.app.registry.graph.manifest(&digest).await {
                debug!(%tag, %digest, "manifest already present, skipping download");
                known = Some(existing);
            }
        }
        let row = match known {
            Some(row) => row,
            None => {
                let pull = self.session.get_manifest(&reference).await?;
                let media_type = self.resolve_media_type(&pull)?;
                self.ingest_any(pull.bytes, media_type).await?
            }
        };

        if !self.collect_signatures(&row).await? {
            info!(%tag, "skipping unsigned content under a signed-only sync");
            return Ok(false);
        }

        self.refs.push(ContentRef::Tag {
            name: tag.to_string(),
            manifest: row.digest.clone(),
        });
        Ok(true)
    }

    fn resolve_media_type(&self, pull: &ociclient::ManifestPull) -> Result<String> {
        let data: serde_json::Value = serde_json::from_slice(&pull.bytes)
            .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest JSON: {e}")))?;
        crate::content::media_type::determine_media_type(&data, pull.media_type.as_deref())
    }

    /// Ingest a manifest of any schema, recursing through index entries.
    fn ingest_any(
        &mut self,
        raw: Bytes,
        media_type: String,
    ) -> futures::future::BoxFuture<'_, Result<ManifestRow>> {
        Box::pin(async move {
            if crate::content::media_type::is_manifest_list(&media_type) {
                self.ingest_index(raw, media_type).await
            } else {
                self.ingest_image(raw, media_type).await
            }
        })
    }

    async fn ingest_index(&mut self, raw: Bytes, media_type: String) -> Result<ManifestRow> {
        let index: ociclient::ImageIndex = serde_json::from_slice(&raw)
            .map_err(|e| AppError::ManifestInvalid(format!("malformed index: {e}")))?;

        for descriptor in &index.manifests {
            if self.app.registry.graph.has_manifest(&descriptor.digest).await {
                continue;
            }
            let reference = Reference::Digest(descriptor.digest.clone());
            let pull = self.session.get_manifest(&reference).await?;
            let sub_type = self.resolve_media_type(&pull)?;
            let row = self.ingest_any(pull.bytes, sub_type).await?;
            if row.digest != descriptor.digest {
                return Err(AppError::ManifestInvalid(format!(
                    "listed manifest {} hashed to {}",
                    descriptor.digest, row.digest
                )));
            }
        }

        self.app
            .registry
            .graph
            .put_manifest(
                raw,
                &media_type,
                &self.app.media_types,
                self.app.config.registry.payload_max_bytes,
                None,
            )
            .await
    }

    async fn ingest_image(&mut self, raw: Bytes, media_type: String) -> Result<ManifestRow> {
        let mut config_labels = None;

        if crate::content::media_type::is_schema1(&media_type) {
            let v1: ociclient::SignedManifestV1 = serde_json::from_slice(&raw)
                .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest: {e}")))?;
            for layer in &v1.fs_layers {
                self.ingest_layer(&layer.blob_sum, 0).await?;
            }
        } else {
            let manifest: ociclient::ImageManifest = serde_json::from_slice(&raw)
                .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest: {e}")))?;

            // The config blob is downloaded regardless of the policy; its
            // labels feed the manifest characteristics.
            let config_bytes = self.fetch_blob_stored(&manifest.config.digest).await?;
            config_labels = Some(labels_from_config(&config_bytes));

            for layer in &manifest.layers {
                self.ingest_layer(&layer.digest, layer.size).await?;
            }
        }

        self.app
            .registry
            .graph
            .put_manifest(
                raw,
                &media_type,
                &self.app.media_types,
                self.app.config.registry.payload_max_bytes,
                config_labels,
            )
            .await
    }

    /// Record a layer blob, downloading its bytes only under `immediate`.
    async fn ingest_layer(&mut self, digest: &OciDigest, declared_size: u64) -> Result<()> {
        match self.remote.policy {
            DownloadPolicy::Immediate => {
                self.fetch_blob_stored(digest).await?;
            }
            DownloadPolicy::OnDemand | DownloadPolicy::Streamed => {
                self.app
                    .registry
                    .graph
                    .ensure_blob(digest.clone(), declared_size)
                    .await;
                self.app
                    .registry
                    .record_remote_blob(
                        digest.clone(),
                        RemoteBlobSource {
                            remote: self.remote.name.clone(),
                            upstream_name: self.upstream_name.clone(),
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Fetch a blob into the object store, deduplicating on digest.
    async fn fetch_blob_stored(&mut self, digest: &OciDigest) -> Result<Bytes> {
        if self.app.store.exists(digest).await? {
            let bytes = self.app.store.read(digest).await?;
            self.app
                .registry
                .graph
                .ensure_blob(digest.clone(), bytes.len() as u64)
                .await;
            return Ok(bytes);
        }
        let bytes = self.session.fetch_blob(digest).await?;
        let fetched = OciDigest::sha256_of(&bytes);
        if &fetched != digest {
            return Err(AppError::DigestInvalid(format!(
                "upstream served {fetched} for {digest}"
            )));
        }
        self.app.store.put_bytes_at(digest, bytes.clone()).await?;
        self.app
            .registry
            .graph
            .ensure_blob(digest.clone(), bytes.len() as u64)
            .await;
        Ok(bytes)
    }

    /// Discover and ingest signatures for a manifest (and, for a list, each
    /// listed image). Returns false when signed-only filtering rejects it.
    async fn collect_signatures(&mut self, row: &ManifestRow) -> Result<bool> {
        let Some(source) = self.signature_source else {
            return Ok(!self.signed_only);
        };

        let mut targets = vec![row.digest.clone()];
        if row.is_list() {
            targets.extend(row.sub_manifests().iter().map(|s| s.digest.clone()));
        }

        let mut all_signed = true;
        for target in targets {
            if self.app.registry.graph.manifest(&target).await.map(|m| m.is_list()) == Some(true) {
                continue;
            }
            let mut found = false;
            match source {
                SignatureSource::ApiExtension => {
                    let list = match self.session.get_signatures(&target).await {
                        Ok(list) => list,
                        Err(ociclient::ClientError::NotFound(_)) => Default::default(),
                        Err(err) => return Err(err.into()),
                    };
                    for signature in list.signatures {
                        if signature.schema_version != sign::SIGNATURE_SCHEMA_VERSION
                            || signature.signature_type != "atomic"
                        {
                            continue;
                        }
                        let Ok(raw) = BASE64.decode(&signature.content) else {
                            continue;
                        };
                        let sig_row = sign::signature_row(
                            &raw,
                            target.clone(),
                            SignatureKind::Atomic,
                            Some(signature.name.clone()),
                        );
                        let sig_row = self.app.registry.graph.put_signature(sig_row).await;
                        self.refs.push(ContentRef::Signature(sig_row.digest));
                        found = true;
                    }
                }
                SignatureSource::Sigstore => {
                    let sigstore = self.remote.sigstore.clone().unwrap();
                    let payloads = self
                        .client
                        .fetch_sigstore_signatures(&sigstore, &self.upstream_name, &target)
                        .await?;
                    for raw in payloads {
                        let sig_row =
                            sign::signature_row(&raw, target.clone(), SignatureKind::Atomic, None);
                        let sig_row = self.app.registry.graph.put_signature(sig_row).await;
                        self.refs.push(ContentRef::Signature(sig_row.digest));
                        found = true;
                    }
                }
            }
            all_signed &= found;
        }

        Ok(all_signed || !self.signed_only)
    }

    /// Cosign stores signatures, attestations and SBOMs as tags derived
    /// from the signed digest. Sync any that exist for already-synced
    /// manifests.
    async fn sync_cosign_tags(&mut self, all_tags: &[String]) -> Result<Vec<String>> {
        let manifest_digests: Vec<OciDigest> = self
            .refs
            .iter()
            .filter_map(|r| match r {
                ContentRef::Tag { manifest, .. } => Some(manifest.clone()),
                _ => None,
            })
            .collect();

        let mut synced = Vec::new();
        for digest in manifest_digests {
            for suffix in [".sig", ".att", ".sbom"] {
                let cosign_tag = format!("sha256-{}{suffix}", digest.hex());
                if !all_tags.contains(&cosign_tag) {
                    continue;
                }
                let reference = Reference::Tag(cosign_tag.clone());
                let pull = match self.session.get_manifest(&reference).await {
                    Ok(pull) => pull,
                    Err(ociclient::ClientError::NotFound(_)) => continue,
                    Err(err) => return Err(err.into()),
                };
                let media_type = self.resolve_media_type(&pull)?;
                let row = self.ingest_any(pull.bytes, media_type).await?;

                if suffix == ".sig" {
                    self.record_cosign_signature(&row, &digest).await;
                }
                self.refs.push(ContentRef::Tag {
                    name: cosign_tag.clone(),
                    manifest: row.digest.clone(),
                });
                synced.push(cosign_tag);
            }
        }
        Ok(synced)
    }

    async fn record_cosign_signature(&mut self, sig_manifest: &ManifestRow, target: &OciDigest) {
        // The payload layer carries the simple-signing document when its
        // bytes made it into the store.
        let payload = match &sig_manifest.kind {
            crate::content::ManifestKind::Image { layers, .. } => {
                match layers.iter().find(|l| l.media_type == COSIGN_PAYLOAD) {
                    Some(layer) => self.app.store.read(&layer.digest).await.ok(),
                    None => None,
                }
            }
            _ => None,
        };
        let raw = payload.unwrap_or_default();
        let sig_row = sign::signature_row(&raw, target.clone(), SignatureKind::Cosign, None);
        let sig_row = self.app.registry.graph.put_signature(sig_row).await;
        self.refs.push(ContentRef::Signature(sig_row.digest));
    }
}

/// Run a full sync of `repository` from `remote_name`.
#[instrument(skip(app, options), fields(repository = %repository, remote = %remote_name))]
pub async fn synchronize(
    app: &App,
    repository: &str,
    remote_name: &str,
    options: SyncOptions,
) -> Result<SyncSummary> {
    let remote = app
        .registry
        .remote(remote_name)
        .await
        .ok_or_else(|| AppError::RepositoryNotFound(format!("remote {remote_name}")))?;
    let repo = app
        .registry
        .repository(repository)
        .await
        .ok_or_else(|| AppError::RepositoryNotFound(repository.to_string()))?;
    if repo.kind != RepositoryKind::Sync {
        return Err(AppError::Unsupported(format!(
            "repository {repository} is not a sync repository"
        )));
    }

    let upstream_name = remote
        .upstream_name
        .clone()
        .unwrap_or_else(|| repository.to_string());
    let mut run = SyncRun::new(app, remote.clone(), upstream_name, options.signed_only).await?;

    let all_tags = run.session.list_tags().await?;
    let wanted = filter_tags(&all_tags, &remote.include_tags, &remote.exclude_tags);
    info!(
        upstream = wanted.len(),
        listed = all_tags.len(),
        "discovered upstream tags"
    );

    let mut summary = SyncSummary::default();
    for tag in &wanted {
        match run.sync_tag(tag).await {
            Ok(true) => summary.tags_synced.push(tag.clone()),
            Ok(false) => summary.tags_skipped.push(tag.clone()),
            // A tag that vanished between listing and fetch is final for
            // that tag only; transient failures were already retried.
            Err(AppError::ManifestNotFound(_)) => {
                warn!(%tag, "tag disappeared upstream during the sync");
                summary.tags_skipped.push(tag.clone());
            }
            Err(err) => return Err(err),
        }
    }
    let cosign_tags = run.sync_cosign_tags(&all_tags).await?;
    summary.tags_synced.extend(cosign_tags);

    let refs = run.refs;
    let synced_set: HashSet<String> = summary.tags_synced.iter().cloned().collect();

    // Version creation serializes on the repository reservation.
    let resource = format!("repository:{repository}");
    let (version, removed) = app
        .tasks
        .run_reserved("sync", vec![resource], async {
            let manifests = app.registry.graph.manifest_table().await;
            let signatures = app.registry.graph.signature_table().await;
            app.registry
                .update_repository(repository, |repo| {
                    let mut content = repo::recursive_add(repo.latest(), &refs, &manifests);
                    let mut removed = Vec::new();

                    if options.mode == SyncMode::Mirror {
                        let intermediate = crate::repo::RepositoryVersion {
                            number: repo.latest_version,
                            base_version: repo.latest().base_version,
                            content: content.clone(),
                        };
                        let stale: Vec<ContentRef> = intermediate
                            .tags()
                            .into_iter()
                            .filter(|(name, _)| !synced_set.contains(name))
                            .map(|(name, manifest)| ContentRef::Tag { name, manifest })
                            .collect();
                        for content_ref in &stale {
                            if let ContentRef::Tag { name, .. } = content_ref {
                                removed.push(name.clone());
                            }
                        }
                        content =
                            repo::recursive_remove(&intermediate, &stale, &manifests, &signatures);
                    }

                    (repo.commit(content), removed)
                })
                .await
        })
        .await?;
    summary.version = version;
    summary.tags_removed = removed;

    app.registry.persist().await;
    app.cache.invalidate_path(repository).await;
    info!(
        version,
        synced = summary.tags_synced.len(),
        removed = summary.tags_removed.len(),
        "sync finished"
    );
    Ok(summary)
}

/// Synchronously cache a single image for a pull-through distribution.
///
/// Creates the backing repository on first use; every hit adds the
/// requested reference to the latest content and drops older versions.
#[instrument(skip(app, parent), fields(path = %upstream_rest, reference = %reference))]
pub async fn pull_through(
    app: &App,
    parent: &Distribution,
    upstream_rest: &str,
    reference: &Reference,
) -> Result<String> {
    let remote_name = parent
        .remote
        .clone()
        .ok_or_else(|| AppError::Internal("pull-through distribution has no remote".to_string()))?;
    let remote = app
        .registry
        .remote(&remote_name)
        .await
        .ok_or_else(|| AppError::RepositoryNotFound(format!("remote {remote_name}")))?;

    let repository = upstream_rest.to_string();
    app.registry
        .create_sync_repository(&repository, &remote_name)
        .await?;
    let base_path = format!("{}/{}", parent.base_path, upstream_rest);
    if app.registry.distribution(&base_path).await.is_none() {
        app.registry
            .upsert_distribution(Distribution {
                base_path: base_path.clone(),
                repository: repository.clone(),
                version: None,
                private: false,
                remote: Some(remote_name.clone()),
                pull_through: false,
            })
            .await?;
    }

    let mut run = SyncRun::new(app, remote, repository.clone(), false).await?;

    // A HEAD first keeps a missing upstream image from leaving local state
    // behind, and lets a known digest skip the body fetch.
    let head = run
        .session
        .head_manifest(reference)
        .await?
        .ok_or_else(|| {
            AppError::ManifestNotFound(format!(
                "{upstream_rest}:{reference} is not available upstream"
            ))
        })?;
    let known = match head.digest.as_ref() {
        Some(digest) => app.registry.graph.manifest(digest).await,
        None => None,
    };
    let row = match known {
        Some(row) => {
            debug!(digest = %row.digest, "pull-through cache already holds the manifest");
            row
        }
        None => {
            let pull = run.session.get_manifest(reference).await?;
            let media_type = run.resolve_media_type(&pull)?;
            run.ingest_any(pull.bytes, media_type).await?
        }
    };

    match reference {
        Reference::Tag(name) => run.refs.push(ContentRef::Tag {
            name: name.clone(),
            manifest: row.digest.clone(),
        }),
        Reference::Digest(digest) => run.refs.push(ContentRef::Manifest(digest.clone())),
    }
    let refs = run.refs;

    let resource = format!("repository:{repository}");
    app.tasks
        .run_reserved("pull-through", vec![resource], async {
            let manifests = app.registry.graph.manifest_table().await;
            app.registry
                .update_repository(&repository, |repo| {
                    let content = repo::recursive_add(repo.latest(), &refs, &manifests);
                    repo.commit(content);
                    // Only the newest snapshot is ever served.
                    repo.prune_versions();
                })
                .await
        })
        .await?;

    app.registry.persist().await;
    app.cache.invalidate_path(&base_path).await;
    Ok(base_path)
}

/// Fetch a deferred blob from its recorded remote source.
///
/// Streamed-policy blobs are proxied, not stored; on-demand blobs are
/// stored on first pull.
pub async fn fetch_remote_blob(app: &App, digest: &OciDigest) -> Result<Bytes> {
    let source = app
        .registry
        .remote_blob_source(digest)
        .await
        .ok_or_else(|| AppError::BlobNotFound(digest.to_string()))?;
    let remote = app
        .registry
        .remote(&source.remote)
        .await
        .ok_or_else(|| AppError::BlobNotFound(digest.to_string()))?;

    let client = upstream_client(app, &remote);
    let mut session = client.new_session(source.upstream_name.clone());
    let bytes = session.fetch_blob(digest).await?;
    let fetched = OciDigest::sha256_of(&bytes);
    if &fetched != digest {
        return Err(AppError::DigestInvalid(format!(
            "upstream served {fetched} for {digest}"
        )));
    }

    if remote.policy != DownloadPolicy::Streamed {
        app.store.put_bytes_at(digest, bytes.clone()).await?;
        app.registry
            .graph
            .ensure_blob(digest.clone(), bytes.len() as u64)
            .await;
    } else {
        warn!(%digest, "proxying streamed blob without storing it");
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_cover_star_and_question_mark() {
        assert!(wildcard_match("8.*", "8.6"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*-rc*", "8.6-rc1"));
        assert!(wildcard_match("v?", "v1"));
        assert!(!wildcard_match("8.*", "9.0"));
        assert!(!wildcard_match("v?", "v10"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
    }

    #[test]
    fn include_then_exclude_filtering() {
        let tags: Vec<String> = ["8.5", "8.6", "8.6-rc1", "9.0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let include = vec!["8.*".to_string()];
        let exclude = vec!["*-rc*".to_string()];
        assert_eq!(
            filter_tags(&tags, &include, &exclude),
            vec!["8.5".to_string(), "8.6".to_string()]
        );
    }

    #[test]
    fn empty_filters_pass_everything_through() {
        let tags: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(filter_tags(&tags, &[], &[]), tags);
    }

    #[test]
    fn exclude_applies_without_include() {
        let tags: Vec<String> = ["stable", "beta"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            filter_tags(&tags, &[], &["beta".to_string()]),
            vec!["stable".to_string()]
        );
    }
}
