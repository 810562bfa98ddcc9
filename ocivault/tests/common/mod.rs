//! Shared harness for the integration tests: boots a registry on an
//! ephemeral port and hands back the bound URL plus the app state.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::MeterProvider;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use ocivault::api::routes::registry_router;
use ocivault::api::AppMetrics;
use ocivault::config::{AppConfig, NamespaceRoles, StorageConfig};
use ocivault::{App, AppState};

use ociclient::{media_type, Client, Credentials, OciDigest};

pub struct TestServer {
    pub url: String,
    pub state: AppState,
    server: JoinHandle<()>,
}

impl TestServer {
    pub fn client(&self, credentials: Option<Credentials>) -> Client {
        Client::new(self.url.clone(), credentials)
    }

    pub fn alice(&self) -> Client {
        self.client(Some(Credentials {
            username: "alice".to_string(),
            password: "wonderland".to_string(),
        }))
    }

    pub fn stop(self) {
        self.server.abort();
    }
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

pub fn base_config() -> AppConfig {
    let data_dir = std::env::temp_dir().join(format!("ocivault-test-{}", uuid_string()));
    std::fs::create_dir_all(&data_dir).unwrap();

    let mut config = AppConfig {
        storage: StorageConfig {
            fs_root: Some(data_dir),
            ..Default::default()
        },
        ..Default::default()
    };
    config
        .accounts
        .insert("alice".to_string(), "wonderland".to_string());
    config.namespaces.insert(
        "library".to_string(),
        NamespaceRoles {
            owners: vec!["alice".to_string()],
            collaborators: Vec::new(),
            consumers: Vec::new(),
        },
    );
    config
}

fn uuid_string() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Start a registry server with the given configuration tweaks applied.
pub async fn start_server(mutate: impl FnOnce(&mut AppConfig)) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = format!("http://localhost:{port}");

    let mut config = base_config();
    config.port = port;
    config.external_url = Some(url.clone());
    mutate(&mut config);

    let meter = opentelemetry::metrics::noop::NoopMeterProvider::new().meter("test");
    let metrics = AppMetrics::new(&meter);
    let state = App::build(config, metrics).await.unwrap();

    let app = axum::Router::new().merge(registry_router(Arc::clone(&state)));
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start.
    sleep(Duration::from_millis(50)).await;

    TestServer { url, state, server }
}

/// Start a registry with token authentication disabled (Basic auth only).
pub async fn start_basic_server() -> TestServer {
    start_server(|config| {
        config.token.auth_disabled = true;
    })
    .await
}

/// Start a registry with bearer tokens signed by the test ES256 keypair.
pub async fn start_token_server() -> TestServer {
    start_server(|config| {
        config.token.auth_disabled = false;
        config.token.signature_algorithm = "ES256".to_string();
        config.token.private_key_path = Some(fixture("token_es256_private.pem"));
        config.token.public_key_path = Some(fixture("token_es256_public.pem"));
        config.token.service = "ocivault-test".to_string();
    })
    .await
}

/// A pushed image: its manifest bytes, digest and blob digests.
pub struct PushedImage {
    pub manifest_digest: OciDigest,
    pub config_digest: OciDigest,
    pub layer_digest: OciDigest,
    pub manifest_bytes: Vec<u8>,
    pub layer_bytes: Vec<u8>,
}

/// Push a config blob, one layer and a tagged manifest into `repository`.
pub async fn push_image(client: &Client, repository: &str, tag: &str, seed: &str) -> PushedImage {
    let mut session = client.new_session(repository.to_string());

    let config_bytes = format!(r#"{{"architecture":"amd64","os":"linux","config":{{"Labels":{{"seed":"{seed}"}}}}}}"#);
    let layer_bytes = format!("layer-bytes-{seed}").into_bytes();

    let config = session
        .upload_bytes(media_type::CONFIG_BLOB_OCI, config_bytes.as_bytes())
        .await
        .unwrap();
    let layer = session
        .upload_bytes(media_type::REGULAR_BLOB_OCI, &layer_bytes)
        .await
        .unwrap();

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::MANIFEST_OCI,
        "config": {
            "mediaType": media_type::CONFIG_BLOB_OCI,
            "digest": config.digest.to_string(),
            "size": config.size,
        },
        "layers": [{
            "mediaType": media_type::REGULAR_BLOB_OCI,
            "digest": layer.digest.to_string(),
            "size": layer.size,
        }],
    })
    .to_string()
    .into_bytes();

    let manifest_digest = session
        .put_manifest(
            &ociclient::Reference::Tag(tag.to_string()),
            media_type::MANIFEST_OCI,
            bytes::Bytes::from(manifest.clone()),
        )
        .await
        .unwrap();

    PushedImage {
        manifest_digest,
        config_digest: config.digest,
        layer_digest: layer.digest,
        manifest_bytes: manifest,
        layer_bytes,
    }
}
