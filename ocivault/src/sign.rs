//! Signature ingest and emission.
//!
//! Signing itself is delegated to an external signer executable; this
//! module validates payloads, shapes signature rows for the content graph,
//! and bounds signing concurrency.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, instrument};

use ociclient::OciDigest;

use crate::config::AppConfig;
use crate::content::{SignatureKind, SignatureRow};
use crate::error::{AppError, Result};

/// The only simple-signing payload type accepted for atomic signatures.
pub const ATOMIC_TYPE: &str = "atomic container signature";

/// Signature API extension schema version.
pub const SIGNATURE_SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct AtomicPayload {
    pub critical: Critical,
    #[serde(default)]
    pub optional: Optional,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Critical {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub image: CriticalImage,
    pub identity: CriticalIdentity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CriticalImage {
    #[serde(rename = "docker-manifest-digest")]
    pub docker_manifest_digest: OciDigest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CriticalIdentity {
    #[serde(rename = "docker-reference")]
    pub docker_reference: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Optional {
    pub creator: Option<String>,
    pub timestamp: Option<i64>,
}

/// Parse and validate a plain-JSON simple-signing payload against the
/// manifest digest it claims to sign.
pub fn validate_payload(raw: &[u8], expected: &OciDigest) -> Result<AtomicPayload> {
    let payload: AtomicPayload = serde_json::from_slice(raw)
        .map_err(|e| AppError::SignatureInvalid(format!("malformed payload: {e}")))?;
    if payload.critical.payload_type != ATOMIC_TYPE {
        return Err(AppError::SignatureInvalid(format!(
            "unsupported payload type {}",
            payload.critical.payload_type
        )));
    }
    if &payload.critical.image.docker_manifest_digest != expected {
        return Err(AppError::SignatureInvalid(format!(
            "payload signs {}, not {expected}",
            payload.critical.image.docker_manifest_digest
        )));
    }
    Ok(payload)
}

/// Build a signature row from a raw payload.
///
/// GPG-wrapped payloads synced from a sigstore cannot be opened here;
/// they get structural fields only. Plain JSON payloads contribute their
/// creator and timestamp.
pub fn signature_row(
    raw: &[u8],
    signed_manifest: OciDigest,
    kind: SignatureKind,
    name: Option<String>,
) -> SignatureRow {
    let digest = OciDigest::sha256_of(raw);
    let payload: Option<AtomicPayload> = serde_json::from_slice(raw).ok();
    SignatureRow {
        name: name.unwrap_or_else(|| format!("{signed_manifest}@{}", &digest.hex()[..32])),
        digest,
        kind,
        signed_manifest,
        key_id: None,
        timestamp: payload.as_ref().and_then(|p| p.optional.timestamp),
        creator: payload.as_ref().and_then(|p| p.optional.creator.clone()),
        data: BASE64.encode(raw),
    }
}

/// Invokes the external signer executable, bounded by
/// `sync.max_parallel_signing_tasks`.
pub struct SigningAdapter {
    script: Option<PathBuf>,
    permits: Arc<Semaphore>,
}

impl SigningAdapter {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            script: config.signing.script_path.clone(),
            permits: Arc::new(Semaphore::new(config.sync.max_parallel_signing_tasks)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.script.is_some()
    }

    /// Run the signer for one manifest and validate what it produced.
    ///
    /// The signer receives the image reference and digest as arguments and
    /// in its environment, and prints the signature payload on stdout.
    #[instrument(skip(self), fields(reference = %reference, digest = %digest))]
    pub async fn sign(&self, reference: &str, digest: &OciDigest) -> Result<Bytes> {
        let script = self.script.as_ref().ok_or_else(|| {
            AppError::Config("signing.script_path is not configured".to_string())
        })?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::Internal("signing semaphore closed".to_string()))?;

        let output = Command::new(script)
            .arg(reference)
            .arg(digest.to_string())
            .env("OCIVAULT_REFERENCE", reference)
            .env("OCIVAULT_MANIFEST_DIGEST", digest.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Internal(format!("failed to run signer: {e}")))?;

        if !output.status.success() {
            return Err(AppError::SignatureInvalid(format!(
                "signer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        validate_payload(&output.stdout, digest)?;
        info!("external signer produced a signature");
        Ok(Bytes::from(output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_json(digest: &OciDigest) -> Vec<u8> {
        serde_json::json!({
            "critical": {
                "type": ATOMIC_TYPE,
                "image": {"docker-manifest-digest": digest.to_string()},
                "identity": {"docker-reference": "registry.example.com/alice/img:v1"},
            },
            "optional": {"creator": "atomic 2.0", "timestamp": 1_700_000_000},
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_payload_passes() {
        let digest = OciDigest::sha256_of(b"manifest");
        let payload = validate_payload(&payload_json(&digest), &digest).unwrap();
        assert_eq!(payload.critical.image.docker_manifest_digest, digest);
        assert_eq!(payload.optional.creator.as_deref(), Some("atomic 2.0"));
    }

    #[test]
    fn digest_mismatch_is_rejected() {
        let digest = OciDigest::sha256_of(b"manifest");
        let other = OciDigest::sha256_of(b"other");
        let err = validate_payload(&payload_json(&digest), &other).unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_INVALID");
    }

    #[test]
    fn wrong_payload_type_is_rejected() {
        let digest = OciDigest::sha256_of(b"manifest");
        let raw = serde_json::json!({
            "critical": {
                "type": "cosign container image signature",
                "image": {"docker-manifest-digest": digest.to_string()},
                "identity": {"docker-reference": "x"},
            },
        })
        .to_string();
        assert!(validate_payload(raw.as_bytes(), &digest).is_err());
    }

    #[test]
    fn row_name_defaults_to_digest_prefix_form() {
        let manifest = OciDigest::sha256_of(b"manifest");
        let raw = payload_json(&manifest);
        let row = signature_row(&raw, manifest.clone(), SignatureKind::Atomic, None);
        assert!(row.name.starts_with(&format!("{manifest}@")));
        assert_eq!(row.name.len(), manifest.to_string().len() + 1 + 32);
        assert_eq!(row.signed_manifest, manifest);
        assert_eq!(row.timestamp, Some(1_700_000_000));
        assert_eq!(BASE64.decode(&row.data).unwrap(), raw);
    }
}
