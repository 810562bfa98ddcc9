use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::digest::OciDigest;

/// Media types understood by the registry wire protocol.
pub mod media_type {
    pub const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const MANIFEST_OCI: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const INDEX_OCI: &str = "application/vnd.oci.image.index.v1+json";

    pub const CONFIG_BLOB: &str = "application/vnd.docker.container.image.v1+json";
    pub const CONFIG_BLOB_OCI: &str = "application/vnd.oci.image.config.v1+json";
    pub const REGULAR_BLOB: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const FOREIGN_BLOB: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
    pub const REGULAR_BLOB_OCI: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const REGULAR_BLOB_OCI_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const REGULAR_BLOB_OCI_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const FOREIGN_BLOB_OCI: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
    pub const OCTET_STREAM: &str = "application/octet-stream";

    pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
    pub const HELM_CHART: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
    pub const HELM_PROVENANCE: &str = "application/vnd.cncf.helm.chart.provenance.v1.prov";

    pub const COSIGN_PAYLOAD: &str = "application/vnd.dev.cosign.simplesigning.v1+json";

    /// Accept values a sync sends when negotiating a manifest schema.
    pub const V2_ACCEPT: [&str; 6] = [
        MANIFEST_V2,
        MANIFEST_V1,
        MANIFEST_V1_SIGNED,
        MANIFEST_LIST,
        INDEX_OCI,
        MANIFEST_OCI,
    ];
}

/// Represents a descriptor for a content blob in an OCI registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Digest of the referenced content
    pub digest: OciDigest,
    /// Size of the referenced content in bytes
    pub size: u64,
    /// Optional platform information, set on manifest list entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Optional annotations on this descriptor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    /// Optional alternate download URIs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

/// Represents platform information for a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture
    pub architecture: String,
    /// Operating system
    pub os: String,
    /// Optional OS version
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Optional OS features
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    /// Optional variant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Optional CPU features
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

/// Represents an OCI/Docker v2s2 image manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version of the manifest
    pub schema_version: i32,
    /// Media type of the manifest; OCI manifests may omit it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Descriptor for the config blob
    pub config: Descriptor,
    /// Descriptors for the layer blobs
    pub layers: Vec<Descriptor>,
    /// Optional annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Represents an OCI image index / Docker manifest list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version of the manifest list
    pub schema_version: i32,
    /// Media type of the manifest list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Descriptors of the listed manifests
    pub manifests: Vec<Descriptor>,
    /// Optional annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// A layer reference in a schema-1 manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: OciDigest,
}

/// A history entry in a schema-1 manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1History {
    pub v1_compatibility: String,
}

/// A JWS signature block attached to a signed schema-1 manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsSignature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<serde_json::Value>,
    pub protected: String,
    pub signature: String,
}

/// Represents a Docker v2 schema-1 manifest, signed or bare
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifestV1 {
    pub schema_version: i32,
    pub name: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub fs_layers: Vec<FsLayer>,
    #[serde(default)]
    pub history: Vec<V1History>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<JwsSignature>,
}

/// Enum covering every manifest schema the wire protocol can carry
#[derive(Debug, Clone)]
pub enum ManifestVariant {
    /// OCI image manifest or Docker v2s2 manifest
    Image(ImageManifest),
    /// OCI image index or Docker manifest list
    Index(ImageIndex),
    /// Docker v2 schema-1, with or without a JWS block
    SignedV1(SignedManifestV1),
}

/// `/v2/{name}/tags/list` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagList {
    pub name: String,
    pub tags: Vec<String>,
}

/// `/v2/_catalog` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub repositories: Vec<String>,
}

/// Token response issued by a bearer auth service
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub issued_at: Option<String>,
}

/// One signature carried by the signature API extension
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSignature {
    pub schema_version: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub signature_type: String,
    /// Base64-encoded signature payload
    pub content: String,
}

/// `/extensions/v2/{name}/signatures/{digest}` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureList {
    pub signatures: Vec<ImageSignature>,
}

/// Distribution v2 error envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_manifest_roundtrip() {
        let raw = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "size": 2
            },
            "layers": []
        }"#;
        let manifest: ImageManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(
            manifest.media_type.as_deref(),
            Some(media_type::MANIFEST_OCI)
        );
        let out = serde_json::to_value(&manifest).unwrap();
        assert_eq!(out["config"]["mediaType"], media_type::CONFIG_BLOB_OCI);
    }

    #[test]
    fn index_platform_fields() {
        let raw = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "size": 7,
                "platform": {"architecture": "amd64", "os": "linux", "os.version": "5.0"}
            }]
        }"#;
        let index: ImageIndex = serde_json::from_str(raw).unwrap();
        let platform = index.manifests[0].platform.as_ref().unwrap();
        assert_eq!(platform.architecture, "amd64");
        assert_eq!(platform.os_version.as_deref(), Some("5.0"));
    }

    #[test]
    fn schema1_fs_layers() {
        let raw = r#"{
            "schemaVersion": 1,
            "name": "library/busybox",
            "tag": "1.0",
            "fsLayers": [{"blobSum": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}],
            "history": [{"v1Compatibility": "{}"}]
        }"#;
        let manifest: SignedManifestV1 = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.fs_layers.len(), 1);
        assert!(manifest.signatures.is_empty());
    }
}
