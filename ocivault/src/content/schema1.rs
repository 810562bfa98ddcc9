//! Digest handling for Docker v2 schema-1 manifests.
//!
//! The digest of a signed schema-1 manifest is computed over the payload
//! without its JWS block. The `protected` header of the first signature
//! records how many bytes of the received JSON were signed
//! (`formatLength`) and the original tail that the signature block
//! displaced (`formatTail`); reassembling those yields the signed payload.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use ociclient::OciDigest;
use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
}

#[derive(Debug, Deserialize)]
struct SignatureBlock {
    protected: String,
}

#[derive(Debug, Deserialize)]
struct SignedEnvelope {
    #[serde(default)]
    signatures: Vec<SignatureBlock>,
}

/// Docker's libtrust emits base64 without padding; add it back.
fn pad_unpadded_b64(unpadded: &str) -> Result<String> {
    let cleaned: String = unpadded
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    match cleaned.len() % 4 {
        0 => Ok(cleaned),
        2 => Ok(format!("{cleaned}==")),
        3 => Ok(format!("{cleaned}=")),
        _ => Err(AppError::ManifestInvalid(format!(
            "invalid base64 in signature block: {unpadded}"
        ))),
    }
}

fn decode_b64(value: &str) -> Result<Vec<u8>> {
    let padded = pad_unpadded_b64(value)?;
    URL_SAFE
        .decode(&padded)
        .or_else(|_| STANDARD.decode(&padded))
        .map_err(|e| AppError::ManifestInvalid(format!("invalid signature base64: {e}")))
}

/// Reconstruct the signed payload of a schema-1 manifest.
///
/// Manifests without a `signatures` block are returned unchanged.
pub fn signed_payload(raw: &[u8]) -> Result<Vec<u8>> {
    let envelope: SignedEnvelope = serde_json::from_slice(raw)
        .map_err(|e| AppError::ManifestInvalid(format!("malformed manifest JSON: {e}")))?;
    let Some(first) = envelope.signatures.first() else {
        return Ok(raw.to_vec());
    };

    let protected = decode_b64(&first.protected)?;
    let protected: ProtectedHeader = serde_json::from_slice(&protected)
        .map_err(|e| AppError::ManifestInvalid(format!("malformed protected header: {e}")))?;

    if protected.format_length > raw.len() {
        return Err(AppError::ManifestInvalid(
            "signature formatLength exceeds the manifest size".to_string(),
        ));
    }
    let tail = decode_b64(&protected.format_tail)?;

    let mut payload = raw[..protected.format_length].to_vec();
    payload.extend_from_slice(&tail);
    Ok(payload)
}

/// Digest under which a schema-1 manifest is stored.
pub fn digest(raw: &[u8]) -> Result<OciDigest> {
    Ok(OciDigest::sha256_of(&signed_payload(raw)?))
}
