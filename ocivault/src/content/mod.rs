pub mod media_type;
pub mod schema1;

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use ociclient::media_type::*;
use ociclient::{OciDigest, Platform};

use crate::error::{AppError, Result};
use crate::store::ObjectStore;

use self::media_type::{is_manifest_list, is_schema1, MediaTypeRegistry};

pub const BOOTC_LABEL: &str = "containers.bootc";
pub const FLATPAK_LABEL: &str = "org.flatpak.ref";

/// A stored layer or config blob. Shared across repositories; immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRow {
    pub digest: OciDigest,
    pub size: u64,
}

/// Reference from a manifest to one of its layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRef {
    pub digest: OciDigest,
    pub media_type: String,
    pub size: u64,
}

/// Reference from a manifest list to one listed manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubManifestRef {
    pub digest: OciDigest,
    pub media_type: String,
    pub platform: Option<Platform>,
}

/// Type-specific manifest payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManifestKind {
    Image {
        config: Option<OciDigest>,
        layers: Vec<LayerRef>,
    },
    Index {
        manifests: Vec<SubManifestRef>,
    },
}

/// Flags derived once at ingest from media types and labels.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Characteristics {
    pub is_bootable: bool,
    pub is_flatpak: bool,
    pub is_helm: bool,
    pub is_cosign_signature: bool,
}

/// A stored manifest of any schema. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRow {
    pub digest: OciDigest,
    pub media_type: String,
    pub schema_version: i32,
    pub size: u64,
    pub kind: ManifestKind,
    pub annotations: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub characteristics: Characteristics,
}

impl ManifestRow {
    pub fn is_list(&self) -> bool {
        matches!(self.kind, ManifestKind::Index { .. })
    }

    /// Digests of the config and layer blobs of an image manifest.
    pub fn blob_digests(&self) -> Vec<OciDigest> {
        match &self.kind {
            ManifestKind::Image { config, layers } => {
                let mut digests: Vec<OciDigest> =
                    layers.iter().map(|l| l.digest.clone()).collect();
                if let Some(config) = config {
                    digests.push(config.clone());
                }
                digests
            }
            ManifestKind::Index { .. } => Vec::new(),
        }
    }

    pub fn sub_manifests(&self) -> &[SubManifestRef] {
        match &self.kind {
            ManifestKind::Index { manifests } => manifests,
            ManifestKind::Image { .. } => &[],
        }
    }
}

/// Signature type tags known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    Atomic,
    Cosign,
}

/// A cryptographic attestation over a manifest digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRow {
    pub digest: OciDigest,
    pub name: String,
    pub kind: SignatureKind,
    pub signed_manifest: OciDigest,
    pub key_id: Option<String>,
    pub timestamp: Option<i64>,
    pub creator: Option<String>,
    /// Base64-encoded raw signature payload
    pub data: String,
}

/// Serialized form of the graph, persisted with the registry metadata.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub blobs: HashMap<OciDigest, BlobRow>,
    pub manifests: HashMap<OciDigest, ManifestRow>,
    pub signatures: HashMap<OciDigest, SignatureRow>,
    pub alternate_digests: HashMap<OciDigest, OciDigest>,
}

/// Deduplicated, content-addressed store of blobs, manifests and
/// signatures. Rows are inserted with insert-if-absent semantics keyed by
/// digest; the byte content lives in the object store.
#[derive(Debug)]
pub struct ContentGraph {
    store: ObjectStore,
    blobs: RwLock<HashMap<OciDigest, BlobRow>>,
    manifests: RwLock<HashMap<OciDigest, ManifestRow>>,
    signatures: RwLock<HashMap<OciDigest, SignatureRow>>,
    /// sha224/sha512 aliases -> primary sha256 digest
    alternates: RwLock<HashMap<OciDigest, OciDigest>>,
}

impl ContentGraph {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            store,
            blobs: RwLock::new(HashMap::new()),
            manifests: RwLock::new(HashMap::new()),
            signatures: RwLock::new(HashMap::new()),
            alternates: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    // Blob operations

    /// Record a blob row; idempotent by digest.
    pub async fn ensure_blob(&self, digest: OciDigest, size: u64) -> BlobRow {
        let mut blobs = self.blobs.write().await;
        blobs
            .entry(digest.clone())
            .or_insert_with(|| BlobRow { digest, size })
            .clone()
    }

    pub async fn record_alternate(&self, alternate: OciDigest, primary: OciDigest) {
        self.alternates.write().await.insert(alternate, primary);
    }

    /// Look a blob up by its primary or any alternate digest.
    pub async fn blob(&self, digest: &OciDigest) -> Option<BlobRow> {
        if let Some(row) = self.blobs.read().await.get(digest) {
            return Some(row.clone());
        }
        let primary = self.alternates.read().await.get(digest).cloned()?;
        self.blobs.read().await.get(&primary).cloned()
    }

    pub async fn manifest(&self, digest: &OciDigest) -> Option<ManifestRow> {
        self.manifests.read().await.get(digest).cloned()
    }

    pub async fn has_manifest(&self, digest: &OciDigest) -> bool {
        self.manifests.read().await.contains_key(digest)
    }

    pub async fn signature(&self, digest: &OciDigest) -> Option<SignatureRow> {
        self.signatures.read().await.get(digest).cloned()
    }

    /// All signatures bound to a manifest digest.
    pub async fn signatures_for(&self, manifest: &OciDigest) -> Vec<SignatureRow> {
        self.signatures
            .read()
            .await
            .values()
            .filter(|s| &s.signed_manifest == manifest)
            .cloned()
            .collect()
    }

    /// Validate and store a manifest payload, returning its row.
    ///
    /// `config_labels` carries the labels of the config blob when the caller
    /// has it at hand; label-derived characteristics stay empty otherwise.
    pub async fn put_manifest(
        &self,
        raw: Bytes,
        media_type: &str,
        media_types: &MediaTypeRegistry,
        max_payload_bytes: usize,
        config_labels: Option<HashMap<String, String>>,
    ) -> Result<ManifestRow> {
        if raw.len() > max_payload_bytes {
            return Err(AppError::ManifestInvalid(format!(
                "manifest exceeds the payload limit of {max_payload_bytes} bytes"
            )));
        }
        if !media_type::MANIFEST_TYPES.contains(&media_type) {
            return Err(AppError::ManifestInvalid(format!(
                "unsupported manifest media type {media_type}"
            )));
        }

        let data: Value = serde_json::from_slice(&raw)
            .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest JSON: {e}")))?;

        let digest = if is_schema1(media_type) {
            schema1::digest(&raw)?
        } else {
            OciDigest::sha256_of(&raw)
        };

        let schema_version = data
            .get("schemaVersion")
            .and_then(Value::as_i64)
            .unwrap_or(if is_schema1(media_type) { 1 } else { 2 })
            as i32;

        let annotations = string_map(data.get("annotations"));
        let labels = config_labels.unwrap_or_default();

        let kind = if is_manifest_list(media_type) {
            let index: ociclient::ImageIndex = serde_json::from_slice(&raw)
                .map_err(|e| AppError::ManifestInvalid(format!("malformed index: {e}")))?;
            ManifestKind::Index {
                manifests: index
                    .manifests
                    .into_iter()
                    .map(|d| SubManifestRef {
                        digest: d.digest,
                        media_type: d.media_type,
                        platform: d.platform,
                    })
                    .collect(),
            }
        } else if is_schema1(media_type) {
            let v1: ociclient::SignedManifestV1 = serde_json::from_slice(&raw)
                .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest: {e}")))?;
            ManifestKind::Image {
                config: None,
                layers: v1
                    .fs_layers
                    .into_iter()
                    .map(|l| LayerRef {
                        digest: l.blob_sum,
                        media_type: REGULAR_BLOB.to_string(),
                        size: 0,
                    })
                    .collect(),
            }
        } else {
            let manifest: ociclient::ImageManifest = serde_json::from_slice(&raw)
                .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest: {e}")))?;
            let layer_types: Vec<&str> = manifest
                .layers
                .iter()
                .map(|l| l.media_type.as_str())
                .collect();
            media_types.validate(&manifest.config.media_type, &layer_types)?;
            ManifestKind::Image {
                config: Some(manifest.config.digest),
                layers: manifest
                    .layers
                    .into_iter()
                    .map(|l| LayerRef {
                        digest: l.digest,
                        media_type: l.media_type,
                        size: l.size,
                    })
                    .collect(),
            }
        };

        let characteristics = self
            .derive_characteristics(&data, media_type, &kind, &annotations, &labels)
            .await;

        let row = ManifestRow {
            digest: digest.clone(),
            media_type: media_type.to_string(),
            schema_version,
            size: raw.len() as u64,
            kind,
            annotations,
            labels,
            characteristics,
        };

        self.store.put_bytes_at(&digest, raw).await?;

        let mut manifests = self.manifests.write().await;
        let row = manifests.entry(digest.clone()).or_insert(row).clone();
        debug!(%digest, media_type, "stored manifest");
        Ok(row)
    }

    async fn derive_characteristics(
        &self,
        data: &Value,
        media_type: &str,
        kind: &ManifestKind,
        annotations: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Characteristics {
        let mut characteristics = Characteristics::default();
        match kind {
            ManifestKind::Image { layers, .. } => {
                characteristics.is_helm = data
                    .get("config")
                    .and_then(|c| c.get("mediaType"))
                    .and_then(Value::as_str)
                    == Some(HELM_CONFIG);
                characteristics.is_cosign_signature = !is_schema1(media_type)
                    && layers.iter().any(|l| l.media_type == COSIGN_PAYLOAD);
                characteristics.is_bootable = labels.get(BOOTC_LABEL).map(String::as_str)
                    == Some("1")
                    || annotations.get(BOOTC_LABEL).map(String::as_str) == Some("1");
                characteristics.is_flatpak = labels.contains_key(FLATPAK_LABEL);
            }
            ManifestKind::Index { manifests } => {
                // A list inherits the nature of the images it lists.
                let rows = self.manifests.read().await;
                for sub in manifests {
                    if let Some(row) = rows.get(&sub.digest) {
                        characteristics.is_bootable |= row.characteristics.is_bootable;
                        characteristics.is_flatpak |= row.characteristics.is_flatpak;
                    }
                }
            }
        }
        characteristics
    }

    /// Record a signature row; idempotent by digest.
    pub async fn put_signature(&self, row: SignatureRow) -> SignatureRow {
        let mut signatures = self.signatures.write().await;
        signatures
            .entry(row.digest.clone())
            .or_insert(row)
            .clone()
    }

    /// Read manifest lookup tables for closure computation.
    pub async fn manifest_table(&self) -> HashMap<OciDigest, ManifestRow> {
        self.manifests.read().await.clone()
    }

    pub async fn signature_table(&self) -> HashMap<OciDigest, SignatureRow> {
        self.signatures.read().await.clone()
    }

    /// Drop rows (and their bytes) that no repository version references.
    pub async fn retain_referenced(
        &self,
        referenced: &std::collections::HashSet<OciDigest>,
    ) -> Result<usize> {
        let mut removed = 0;
        let mut doomed: Vec<OciDigest> = Vec::new();
        {
            let mut manifests = self.manifests.write().await;
            manifests.retain(|digest, _| {
                let keep = referenced.contains(digest);
                if !keep {
                    doomed.push(digest.clone());
                }
                keep
            });
            let mut blobs = self.blobs.write().await;
            blobs.retain(|digest, _| {
                let keep = referenced.contains(digest);
                if !keep {
                    doomed.push(digest.clone());
                }
                keep
            });
            let mut signatures = self.signatures.write().await;
            signatures.retain(|digest, row| {
                let keep =
                    referenced.contains(digest) || referenced.contains(&row.signed_manifest);
                if !keep {
                    doomed.push(digest.clone());
                }
                keep
            });
            let mut alternates = self.alternates.write().await;
            alternates.retain(|_, primary| referenced.contains(primary));
        }
        for digest in doomed {
            if self.store.exists(&digest).await.unwrap_or(false) {
                self.store.delete(&digest).await?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    // Snapshot persistence

    pub async fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            blobs: self.blobs.read().await.clone(),
            manifests: self.manifests.read().await.clone(),
            signatures: self.signatures.read().await.clone(),
            alternate_digests: self.alternates.read().await.clone(),
        }
    }

    pub async fn restore(&self, snapshot: GraphSnapshot) {
        *self.blobs.write().await = snapshot.blobs;
        *self.manifests.write().await = snapshot.manifests;
        *self.signatures.write().await = snapshot.signatures;
        *self.alternates.write().await = snapshot.alternate_digests;
    }
}

/// Labels recorded in an image config blob.
pub fn labels_from_config(config_bytes: &[u8]) -> HashMap<String, String> {
    let Ok(data) = serde_json::from_slice::<Value>(config_bytes) else {
        return HashMap::new();
    };
    string_map(data.get("config").and_then(|c| c.get("Labels")))
}

fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(Value::Object(entries)) = value {
        for (key, value) in entries {
            if let Value::String(value) = value {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    map
}
