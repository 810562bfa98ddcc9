use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL clients reach this registry under; challenges and
    /// pagination links derive from it
    pub external_url: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    /// username -> password, checked on Basic authentication
    #[serde(default)]
    pub accounts: HashMap<String, String>,
    /// namespace -> role membership
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceRoles>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            external_url: None,
            storage: StorageConfig::default(),
            token: TokenConfig::default(),
            registry: RegistryConfig::default(),
            sync: SyncConfig::default(),
            signing: SigningConfig::default(),
            accounts: HashMap::new(),
            namespaces: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub fs_root: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    /// Serve blobs with a 302 to a presigned URL instead of proxying bytes
    #[serde(default)]
    pub redirect: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            fs_root: Some(PathBuf::from("./data")),
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            redirect: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Disable the bearer flow entirely; Basic/Remote-User applies instead
    #[serde(default)]
    pub auth_disabled: bool,
    /// Advertised realm of the token endpoint, also used as the `iss` claim
    pub server_url: Option<String>,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_algorithm")]
    pub signature_algorithm: String,
    pub private_key_path: Option<PathBuf>,
    pub public_key_path: Option<PathBuf>,
    #[serde(default = "default_token_expiration")]
    pub expiration_seconds: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            auth_disabled: false,
            server_url: None,
            service: default_service(),
            signature_algorithm: default_algorithm(),
            private_key_path: None,
            public_key_path: None,
            expiration_seconds: default_token_expiration(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Cap on manifest and signature payload sizes
    #[serde(default = "default_payload_max")]
    pub payload_max_bytes: usize,
    /// Cap on a single request body (one upload chunk)
    #[serde(default = "default_chunk_max")]
    pub chunk_max_bytes: usize,
    /// config media type -> allowed layer media types, merged into the
    /// built-in allow-list
    #[serde(default)]
    pub additional_artifact_types: HashMap<String, Vec<String>>,
    /// Accept layer media types outside the allow-list
    #[serde(default)]
    pub relaxed_layer_validation: bool,
    /// Extra digest algorithms computed on blob commit (sha224, sha512)
    #[serde(default)]
    pub extra_digest_algorithms: Vec<String>,
    /// Cache manifest GET responses
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            payload_max_bytes: default_payload_max(),
            chunk_max_bytes: default_chunk_max(),
            additional_artifact_types: HashMap::new(),
            relaxed_layer_validation: false,
            extra_digest_algorithms: Vec::new(),
            cache_enabled: false,
            cache_ttl_seconds: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_signing")]
    pub max_parallel_signing_tasks: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_parallel_signing_tasks: default_max_signing(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SigningConfig {
    /// External signer executable; signing is disabled when unset
    pub script_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NamespaceRoles {
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub consumers: Vec<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_service() -> String {
    "ocivault".to_string()
}

fn default_algorithm() -> String {
    "ES256".to_string()
}

fn default_token_expiration() -> u64 {
    300
}

fn default_payload_max() -> usize {
    4 * 1024 * 1024
}

fn default_chunk_max() -> usize {
    256 * 1024 * 1024
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_signing() -> usize {
    10
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("OCIVAULT").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Realm advertised in WWW-Authenticate challenges.
    pub fn token_realm(&self, request_base: &str) -> String {
        match &self.token.server_url {
            Some(url) => url.clone(),
            None => format!("{}/token/", request_base.trim_end_matches('/')),
        }
    }
}
