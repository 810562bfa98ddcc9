use std::collections::HashMap;

use ociclient::media_type::*;
use serde_json::Value;

use crate::config::RegistryConfig;
use crate::error::{AppError, Result};

/// All manifest media types the registry will store.
pub const MANIFEST_TYPES: [&str; 6] = [
    MANIFEST_V1,
    MANIFEST_V1_SIGNED,
    MANIFEST_V2,
    MANIFEST_LIST,
    MANIFEST_OCI,
    INDEX_OCI,
];

pub const LIST_TYPES: [&str; 2] = [MANIFEST_LIST, INDEX_OCI];

pub const V1_TYPES: [&str; 2] = [MANIFEST_V1, MANIFEST_V1_SIGNED];

pub fn is_manifest_list(media_type: &str) -> bool {
    LIST_TYPES.contains(&media_type)
}

pub fn is_schema1(media_type: &str) -> bool {
    V1_TYPES.contains(&media_type)
}

/// Allow-list of config media types and the layer types each may carry.
///
/// The built-in OCI/Docker core is always present; deployments extend the
/// table through `registry.additional_artifact_types`.
#[derive(Debug, Clone)]
pub struct MediaTypeRegistry {
    allowed: HashMap<String, Vec<String>>,
    relaxed_layers: bool,
}

impl MediaTypeRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let mut allowed: HashMap<String, Vec<String>> = HashMap::new();
        allowed.insert(
            CONFIG_BLOB.to_string(),
            vec![
                REGULAR_BLOB.to_string(),
                FOREIGN_BLOB.to_string(),
                OCTET_STREAM.to_string(),
            ],
        );
        allowed.insert(
            CONFIG_BLOB_OCI.to_string(),
            vec![
                REGULAR_BLOB_OCI.to_string(),
                REGULAR_BLOB_OCI_TAR.to_string(),
                REGULAR_BLOB_OCI_ZSTD.to_string(),
                FOREIGN_BLOB_OCI.to_string(),
                COSIGN_PAYLOAD.to_string(),
                OCTET_STREAM.to_string(),
            ],
        );
        allowed.insert(
            HELM_CONFIG.to_string(),
            vec![HELM_CHART.to_string(), HELM_PROVENANCE.to_string()],
        );
        for (config_type, layer_types) in &config.additional_artifact_types {
            allowed
                .entry(config_type.clone())
                .or_default()
                .extend(layer_types.iter().cloned());
        }
        Self {
            allowed,
            relaxed_layers: config.relaxed_layer_validation,
        }
    }

    /// Validate an image manifest's config and layer media types.
    pub fn validate(&self, config_type: &str, layer_types: &[&str]) -> Result<()> {
        let allowed_layers = self.allowed.get(config_type).ok_or_else(|| {
            AppError::ManifestInvalid(format!(
                "unknown config media type {config_type}"
            ))
        })?;
        if self.relaxed_layers {
            return Ok(());
        }
        for layer_type in layer_types {
            if !allowed_layers.iter().any(|t| t == layer_type) {
                return Err(AppError::ManifestInvalid(format!(
                    "layer media type {layer_type} is not allowed for config {config_type}"
                )));
            }
        }
        Ok(())
    }
}

/// Identify the media type of a manifest payload.
///
/// Prefers the payload's own `mediaType`, then the transported content type,
/// and finally falls back to shape heuristics the way older clients expect.
pub fn determine_media_type(data: &Value, content_type: Option<&str>) -> Result<String> {
    if let Some(media_type) = data.get("mediaType").and_then(Value::as_str) {
        return Ok(media_type.to_string());
    }
    if let Some(content_type) = content_type {
        let content_type = content_type.split(';').next().unwrap_or("").trim();
        if MANIFEST_TYPES.contains(&content_type) {
            return Ok(content_type.to_string());
        }
    }
    if data.get("manifests").is_some() {
        return Ok(INDEX_OCI.to_string());
    }
    match data.get("schemaVersion").and_then(Value::as_i64) {
        Some(1) => {
            if data.get("signatures").is_some() {
                Ok(MANIFEST_V1_SIGNED.to_string())
            } else {
                Ok(MANIFEST_V1.to_string())
            }
        }
        Some(2) => Ok(MANIFEST_OCI.to_string()),
        _ => Err(AppError::ManifestInvalid(
            "manifest carries no schemaVersion".to_string(),
        )),
    }
}

/// Media types listed in a request's Accept headers, q-values stripped.
pub fn accepted_media_types(headers: &axum::http::HeaderMap) -> Vec<String> {
    let mut accepted = Vec::new();
    for value in headers.get_all(axum::http::header::ACCEPT) {
        if let Ok(value) = value.to_str() {
            for part in value.split(',') {
                let media_type = part.split(';').next().unwrap_or("").trim();
                if !media_type.is_empty() {
                    accepted.push(media_type.to_string());
                }
            }
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn core_types_are_allowed() {
        let registry = MediaTypeRegistry::new(&RegistryConfig::default());
        registry
            .validate(CONFIG_BLOB_OCI, &[REGULAR_BLOB_OCI])
            .unwrap();
        registry.validate(HELM_CONFIG, &[HELM_CHART]).unwrap();
    }

    #[test]
    fn unknown_config_type_is_rejected() {
        let registry = MediaTypeRegistry::new(&RegistryConfig::default());
        let err = registry
            .validate("application/vnd.custom.config.v1+json", &[])
            .unwrap_err();
        assert_eq!(err.code(), "MANIFEST_INVALID");
    }

    #[test]
    fn additional_artifact_types_extend_the_allow_list() {
        let mut config = RegistryConfig::default();
        config.additional_artifact_types.insert(
            "application/vnd.custom.config.v1+json".to_string(),
            vec!["application/vnd.custom.layer.v1.tar".to_string()],
        );
        let registry = MediaTypeRegistry::new(&config);
        registry
            .validate(
                "application/vnd.custom.config.v1+json",
                &["application/vnd.custom.layer.v1.tar"],
            )
            .unwrap();
    }

    #[test]
    fn relaxed_mode_accepts_any_layer_type() {
        let mut config = RegistryConfig::default();
        config.relaxed_layer_validation = true;
        let registry = MediaTypeRegistry::new(&config);
        registry
            .validate(CONFIG_BLOB_OCI, &["application/x-not-a-layer"])
            .unwrap();
    }

    #[test]
    fn strict_mode_rejects_unknown_layer_type() {
        let registry = MediaTypeRegistry::new(&RegistryConfig::default());
        assert!(registry
            .validate(CONFIG_BLOB_OCI, &["application/x-not-a-layer"])
            .is_err());
    }

    #[test]
    fn media_type_prefers_payload_field() {
        let data = serde_json::json!({"mediaType": MANIFEST_V2, "schemaVersion": 2});
        assert_eq!(
            determine_media_type(&data, Some(MANIFEST_OCI)).unwrap(),
            MANIFEST_V2
        );
    }

    #[test]
    fn media_type_infers_signed_schema1() {
        let data = serde_json::json!({"schemaVersion": 1, "signatures": []});
        assert_eq!(
            determine_media_type(&data, None).unwrap(),
            MANIFEST_V1_SIGNED
        );
    }

    #[test]
    fn media_type_infers_index_from_manifest_listing() {
        let data = serde_json::json!({"schemaVersion": 2, "manifests": []});
        assert_eq!(determine_media_type(&data, None).unwrap(), INDEX_OCI);
    }

    #[test]
    fn accept_header_parsing_strips_quality() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::ACCEPT,
            format!("{MANIFEST_V2};q=0.5, {MANIFEST_OCI}").parse().unwrap(),
        );
        assert_eq!(
            accepted_media_types(&headers),
            vec![MANIFEST_V2.to_string(), MANIFEST_OCI.to_string()]
        );
    }
}
