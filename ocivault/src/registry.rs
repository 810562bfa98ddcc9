//! Registry metadata: namespaces, repositories, distributions, remotes and
//! upload sessions, with JSON snapshot persistence through the object
//! store.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use ociclient::OciDigest;

use crate::content::{ContentGraph, GraphSnapshot};
use crate::error::{AppError, Result};
use crate::repo::{ContentRef, Repository, RepositoryKind, RepositoryVersion};
use crate::store::ObjectStore;

/// Distribution v2 repository name grammar.
pub const NAME_PATTERN: &str =
    r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$";

/// Tag name grammar.
pub const TAG_PATTERN: &str = r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$";

pub fn is_valid_name(name: &str) -> bool {
    Regex::new(NAME_PATTERN).unwrap().is_match(name)
}

pub fn is_valid_tag(tag: &str) -> bool {
    Regex::new(TAG_PATTERN).unwrap().is_match(tag)
}

/// Owner of a path prefix of repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub created_by: Option<String>,
}

/// A public endpoint serving one repository version at a base path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub base_path: String,
    pub repository: String,
    /// Pin to an explicit version; `None` follows `latest_version`
    pub version: Option<u64>,
    pub private: bool,
    /// Remote used for pull-through caching
    pub remote: Option<String>,
    /// Whether sub-paths of `base_path` are cached on demand
    pub pull_through: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    #[default]
    Immediate,
    OnDemand,
    Streamed,
}

/// An upstream registry binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub url: String,
    pub upstream_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sigstore: Option<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub policy: DownloadPolicy,
    pub rate_limit: Option<u32>,
}

/// Where a deferred blob's bytes can be fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBlobSource {
    pub remote: String,
    pub upstream_name: String,
}

/// A chunked blob upload in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub uuid: String,
    pub repository: String,
    pub size: u64,
    pub offsets: Vec<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    namespaces: HashMap<String, Namespace>,
    repositories: HashMap<String, Repository>,
    distributions: HashMap<String, Distribution>,
    remotes: HashMap<String, Remote>,
    uploads: HashMap<String, Upload>,
    /// Blobs whose bytes are deferred, with where to fetch them from
    remote_blob_sources: HashMap<OciDigest, RemoteBlobSource>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    meta: Meta,
    graph: GraphSnapshot,
}

/// The registry's relational state. All mutation goes through here; write
/// serialization per repository is enforced by the task runtime's
/// reservations, not by this lock.
#[derive(Debug)]
pub struct Registry {
    store: ObjectStore,
    pub graph: ContentGraph,
    meta: RwLock<Meta>,
}

impl Registry {
    /// Load the registry from its snapshot, or start empty.
    pub async fn open(store: ObjectStore) -> Result<Self> {
        let graph = ContentGraph::new(store.clone());
        let meta = match store.load_meta().await? {
            Some(bytes) => {
                let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes)?;
                graph.restore(snapshot.graph).await;
                info!(
                    repositories = snapshot.meta.repositories.len(),
                    "restored registry metadata"
                );
                snapshot.meta
            }
            None => Meta::default(),
        };
        Ok(Self {
            store,
            graph,
            meta: RwLock::new(meta),
        })
    }

    /// Persist a metadata snapshot. Failures are logged, not fatal; the
    /// next successful mutation writes a fresh snapshot.
    pub async fn persist(&self) {
        let snapshot = RegistrySnapshot {
            meta: {
                let meta = self.meta.read().await;
                Meta {
                    namespaces: meta.namespaces.clone(),
                    repositories: meta.repositories.clone(),
                    distributions: meta.distributions.clone(),
                    remotes: meta.remotes.clone(),
                    uploads: meta.uploads.clone(),
                    remote_blob_sources: meta.remote_blob_sources.clone(),
                }
            },
            graph: self.graph.snapshot().await,
        };
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(err) = self.store.save_meta(Bytes::from(bytes)).await {
                    warn!("failed to persist registry metadata: {err}");
                }
            }
            Err(err) => warn!("failed to serialize registry metadata: {err}"),
        }
    }

    // Namespaces

    pub fn namespace_of(path: &str) -> &str {
        path.split('/').next().unwrap_or(path)
    }

    pub async fn namespace(&self, name: &str) -> Option<Namespace> {
        self.meta.read().await.namespaces.get(name).cloned()
    }

    pub async fn ensure_namespace(&self, name: &str, created_by: Option<&str>) -> Result<()> {
        if !is_valid_name(name) {
            return Err(AppError::RepositoryInvalid(name.to_string()));
        }
        let mut meta = self.meta.write().await;
        meta.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace {
                name: name.to_string(),
                created_by: created_by.map(|s| s.to_string()),
            });
        Ok(())
    }

    // Repositories

    pub async fn repository(&self, name: &str) -> Option<Repository> {
        self.meta.read().await.repositories.get(name).cloned()
    }

    pub async fn repository_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.meta.read().await.repositories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Apply a mutation to a repository under the metadata lock.
    ///
    /// The caller must hold the repository's reservation when the mutation
    /// commits a version; this method only guards map consistency.
    pub async fn update_repository<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Repository) -> R,
    ) -> Result<R> {
        let mut meta = self.meta.write().await;
        let repository = meta
            .repositories
            .get_mut(name)
            .ok_or_else(|| AppError::RepositoryNotFound(name.to_string()))?;
        Ok(f(repository))
    }

    /// Create a push repository and its distribution at the same path.
    pub async fn create_push_repository(
        &self,
        path: &str,
        user: Option<&str>,
    ) -> Result<Repository> {
        if !is_valid_name(path) {
            return Err(AppError::RepositoryInvalid(path.to_string()));
        }
        self.ensure_namespace(Self::namespace_of(path), user).await?;
        let mut meta = self.meta.write().await;
        if let Some(existing) = meta.repositories.get(path) {
            if existing.kind != RepositoryKind::Push {
                return Err(AppError::Unsupported(format!(
                    "repository {path} is backed by a sync remote"
                )));
            }
            return Ok(existing.clone());
        }
        if meta.distributions.contains_key(path) {
            return Err(AppError::Conflict(format!(
                "base path {path} is already in use"
            )));
        }
        let repository = Repository::new(path, RepositoryKind::Push);
        meta.repositories.insert(path.to_string(), repository.clone());
        meta.distributions.insert(
            path.to_string(),
            Distribution {
                base_path: path.to_string(),
                repository: path.to_string(),
                version: None,
                private: false,
                remote: None,
                pull_through: false,
            },
        );
        info!(%path, "created push repository");
        Ok(repository)
    }

    /// Create a sync repository bound to a remote, with a distribution.
    pub async fn create_sync_repository(&self, path: &str, remote: &str) -> Result<Repository> {
        if !is_valid_name(path) {
            return Err(AppError::RepositoryInvalid(path.to_string()));
        }
        self.ensure_namespace(Self::namespace_of(path), None).await?;
        let mut meta = self.meta.write().await;
        if !meta.remotes.contains_key(remote) {
            return Err(AppError::RepositoryNotFound(format!("remote {remote}")));
        }
        if let Some(existing) = meta.repositories.get(path) {
            return Ok(existing.clone());
        }
        let repository = Repository::new(path, RepositoryKind::Sync);
        meta.repositories.insert(path.to_string(), repository.clone());
        meta.distributions
            .entry(path.to_string())
            .or_insert_with(|| Distribution {
                base_path: path.to_string(),
                repository: path.to_string(),
                version: None,
                private: false,
                remote: Some(remote.to_string()),
                pull_through: false,
            });
        info!(%path, %remote, "created sync repository");
        Ok(repository)
    }

    // Distributions

    pub async fn distribution(&self, base_path: &str) -> Option<Distribution> {
        self.meta.read().await.distributions.get(base_path).cloned()
    }

    pub async fn upsert_distribution(&self, distribution: Distribution) -> Result<()> {
        if !is_valid_name(&distribution.base_path) {
            return Err(AppError::RepositoryInvalid(distribution.base_path));
        }
        let mut meta = self.meta.write().await;
        meta.distributions
            .insert(distribution.base_path.clone(), distribution);
        Ok(())
    }

    /// Distribution base paths in stable lexical order for the catalog.
    pub async fn catalog(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .meta
            .read()
            .await
            .distributions
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Resolve a served path to its distribution, repository and the
    /// version the distribution is bound to.
    pub async fn resolve(
        &self,
        base_path: &str,
    ) -> Result<(Distribution, Repository, RepositoryVersion)> {
        let meta = self.meta.read().await;
        let distribution = meta
            .distributions
            .get(base_path)
            .ok_or_else(|| AppError::RepositoryNotFound(base_path.to_string()))?
            .clone();
        let repository = meta
            .repositories
            .get(&distribution.repository)
            .ok_or_else(|| AppError::RepositoryNotFound(base_path.to_string()))?
            .clone();
        let version = match distribution.version {
            Some(number) => repository
                .version(number)
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "distribution {base_path} pins missing version {number}"
                    ))
                })?
                .clone(),
            None => repository.latest().clone(),
        };
        Ok((distribution, repository, version))
    }

    /// Find the pull-through distribution whose base path prefixes `path`,
    /// returning it with the upstream remainder.
    pub async fn pull_through_parent(&self, path: &str) -> Option<(Distribution, String)> {
        let meta = self.meta.read().await;
        let mut prefix = path.to_string();
        while let Some(idx) = prefix.rfind('/') {
            prefix.truncate(idx);
            if let Some(distribution) = meta.distributions.get(&prefix) {
                if distribution.pull_through && distribution.remote.is_some() {
                    let remainder = path[prefix.len() + 1..].to_string();
                    return Some((distribution.clone(), remainder));
                }
            }
        }
        None
    }

    // Remotes

    pub async fn remote(&self, name: &str) -> Option<Remote> {
        self.meta.read().await.remotes.get(name).cloned()
    }

    pub async fn upsert_remote(&self, remote: Remote) {
        self.meta
            .write()
            .await
            .remotes
            .insert(remote.name.clone(), remote);
    }

    pub async fn record_remote_blob(&self, digest: OciDigest, source: RemoteBlobSource) {
        self.meta
            .write()
            .await
            .remote_blob_sources
            .insert(digest, source);
    }

    pub async fn remote_blob_source(&self, digest: &OciDigest) -> Option<RemoteBlobSource> {
        self.meta
            .read()
            .await
            .remote_blob_sources
            .get(digest)
            .cloned()
    }

    // Uploads

    pub async fn create_upload(&self, repository: &str) -> Upload {
        let upload = Upload {
            uuid: uuid::Uuid::new_v4().to_string(),
            repository: repository.to_string(),
            size: 0,
            offsets: Vec::new(),
        };
        self.meta
            .write()
            .await
            .uploads
            .insert(upload.uuid.clone(), upload.clone());
        upload
    }

    pub async fn upload(&self, uuid: &str) -> Option<Upload> {
        self.meta.read().await.uploads.get(uuid).cloned()
    }

    pub async fn update_upload<R>(
        &self,
        uuid: &str,
        f: impl FnOnce(&mut Upload) -> R,
    ) -> Result<R> {
        let mut meta = self.meta.write().await;
        let upload = meta
            .uploads
            .get_mut(uuid)
            .ok_or_else(|| AppError::UploadNotFound(uuid.to_string()))?;
        Ok(f(upload))
    }

    pub async fn delete_upload(&self, uuid: &str) -> Option<Upload> {
        self.meta.write().await.uploads.remove(uuid)
    }

    // Orphan reclaim

    /// Digests referenced by any repository version or pending set.
    async fn referenced_digests(&self) -> HashSet<OciDigest> {
        let meta = self.meta.read().await;
        let mut referenced = HashSet::new();
        for repository in meta.repositories.values() {
            for version in repository.versions.values() {
                for content_ref in &version.content {
                    match content_ref {
                        ContentRef::Blob(d)
                        | ContentRef::Manifest(d)
                        | ContentRef::Signature(d) => {
                            referenced.insert(d.clone());
                        }
                        ContentRef::Tag { manifest, .. } => {
                            referenced.insert(manifest.clone());
                        }
                    }
                }
            }
            referenced.extend(repository.pending_blobs.iter().cloned());
            referenced.extend(repository.pending_manifests.iter().cloned());
        }
        referenced
    }

    /// Delete graph rows and bytes that nothing references any more.
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let referenced = self.referenced_digests().await;
        let removed = self.graph.retain_referenced(&referenced).await?;
        if removed > 0 {
            info!(removed, "reclaimed orphaned content");
            self.persist().await;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    async fn registry() -> Registry {
        let dir = std::env::temp_dir().join(format!("ocivault-reg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = AppConfig {
            storage: crate::config::StorageConfig {
                fs_root: Some(dir),
                ..Default::default()
            },
            ..Default::default()
        };
        Registry::open(ObjectStore::new(&config).await.unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn name_grammar_accepts_namespaced_paths() {
        assert!(is_valid_name("alice/img"));
        assert!(is_valid_name("library/busybox"));
        assert!(is_valid_name("a-b/c.d/e_f"));
        assert!(!is_valid_name("Alice/img"));
        assert!(!is_valid_name("alice//img"));
        assert!(!is_valid_name("alice/img/"));
        assert!(!is_valid_name("-alice"));
    }

    #[test]
    fn tag_grammar_limits_charset_and_length() {
        assert!(is_valid_tag("v1.0"));
        assert!(is_valid_tag("_internal"));
        assert!(is_valid_tag("8.6-rc1"));
        assert!(!is_valid_tag(".hidden"));
        assert!(!is_valid_tag("-dash"));
        assert!(!is_valid_tag(&"a".repeat(129)));
        assert!(is_valid_tag(&"a".repeat(128)));
    }

    #[tokio::test]
    async fn push_repository_creates_namespace_and_distribution() {
        let registry = registry().await;
        registry
            .create_push_repository("alice/img", Some("alice"))
            .await
            .unwrap();
        assert!(registry.namespace("alice").await.is_some());
        let distribution = registry.distribution("alice/img").await.unwrap();
        assert_eq!(distribution.repository, "alice/img");
        assert!(!distribution.private);

        let (_, repository, version) = registry.resolve("alice/img").await.unwrap();
        assert_eq!(repository.kind, RepositoryKind::Push);
        assert_eq!(version.number, 0);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let registry = registry().await;
        let err = registry
            .create_push_repository("UPPER/case", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NAME_INVALID");
    }

    #[tokio::test]
    async fn pull_through_parent_matches_longest_prefix() {
        let registry = registry().await;
        registry
            .upsert_remote(Remote {
                name: "dockerhub".to_string(),
                url: "https://registry-1.docker.io".to_string(),
                upstream_name: None,
                username: None,
                password: None,
                sigstore: None,
                include_tags: Vec::new(),
                exclude_tags: Vec::new(),
                policy: DownloadPolicy::OnDemand,
                rate_limit: None,
            })
            .await;
        registry
            .upsert_distribution(Distribution {
                base_path: "docker-cache".to_string(),
                repository: "docker-cache".to_string(),
                version: None,
                private: false,
                remote: Some("dockerhub".to_string()),
                pull_through: true,
            })
            .await
            .unwrap();

        let (distribution, remainder) = registry
            .pull_through_parent("docker-cache/library/busybox")
            .await
            .unwrap();
        assert_eq!(distribution.base_path, "docker-cache");
        assert_eq!(remainder, "library/busybox");

        assert!(registry.pull_through_parent("other/path").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_roundtrips_through_the_store() {
        let dir = std::env::temp_dir().join(format!("ocivault-reg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = AppConfig {
            storage: crate::config::StorageConfig {
                fs_root: Some(dir),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = ObjectStore::new(&config).await.unwrap();

        {
            let registry = Registry::open(store.clone()).await.unwrap();
            registry
                .create_push_repository("alice/img", Some("alice"))
                .await
                .unwrap();
            registry.persist().await;
        }

        let registry = Registry::open(store).await.unwrap();
        assert!(registry.repository("alice/img").await.is_some());
        assert!(registry.distribution("alice/img").await.is_some());
    }

    #[tokio::test]
    async fn upload_lifecycle() {
        let registry = registry().await;
        registry
            .create_push_repository("alice/img", None)
            .await
            .unwrap();
        let upload = registry.create_upload("alice/img").await;
        registry
            .update_upload(&upload.uuid, |u| {
                u.offsets.push(0);
                u.size = 10;
            })
            .await
            .unwrap();
        assert_eq!(registry.upload(&upload.uuid).await.unwrap().size, 10);
        registry.delete_upload(&upload.uuid).await.unwrap();
        assert!(registry.upload(&upload.uuid).await.is_none());
    }
}
