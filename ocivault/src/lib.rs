//! ocivault: a content-addressed OCI/Docker registry that serves the
//! Distribution v2 protocol as an origin for pushed images and as a
//! caching mirror of upstream registries.

pub mod api;
pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod registry;
pub mod repo;
pub mod sign;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod token;

// Re-export the registry client used by the synchronizer and tests
pub use ociclient;

use std::sync::Arc;

use tracing::info;

use crate::api::AppMetrics;
use crate::cache::ResponseCache;
use crate::config::AppConfig;
use crate::content::media_type::MediaTypeRegistry;
use crate::content::SignatureKind;
use crate::error::Result;
use crate::registry::Registry;
use crate::repo::ContentRef;
use crate::sign::SigningAdapter;
use crate::store::ObjectStore;
use crate::tasks::TaskRuntime;
use crate::token::TokenService;

/// Shared server state.
pub struct App {
    pub config: AppConfig,
    /// Base URL clients reach this registry under; drives the advertised
    /// token realm.
    pub external_url: String,
    pub store: ObjectStore,
    pub registry: Registry,
    pub tokens: TokenService,
    pub tasks: Arc<TaskRuntime>,
    pub cache: ResponseCache,
    pub signer: SigningAdapter,
    pub media_types: MediaTypeRegistry,
    pub metrics: AppMetrics,
}

pub type AppState = Arc<App>;

impl App {
    pub async fn build(config: AppConfig, metrics: AppMetrics) -> Result<AppState> {
        let store = ObjectStore::new(&config).await?;
        let registry = Registry::open(store.clone()).await?;
        let tokens = TokenService::new(&config)?;
        let external_url = config
            .external_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", config.port));
        Ok(Arc::new(App {
            external_url,
            media_types: MediaTypeRegistry::new(&config.registry),
            cache: ResponseCache::new(&config),
            signer: SigningAdapter::new(&config),
            tasks: Arc::new(TaskRuntime::new()),
            store,
            registry,
            tokens,
            metrics,
            config,
        }))
    }

    /// Delete unreferenced graph rows and bytes, under a registry-wide
    /// reservation so no version commit races the sweep.
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        self.tasks
            .run_reserved(
                "reclaim",
                vec!["registry".to_string()],
                self.registry.reclaim_orphans(),
            )
            .await
    }

    /// Sign a tagged manifest with the external signer and commit the
    /// signature into a new repository version.
    pub async fn sign_tagged_manifest(&self, repository: &str, tag: &str) -> Result<u64> {
        let (_, _, version) = self.registry.resolve(repository).await?;
        let digest = version.tag(tag).ok_or_else(|| {
            crate::error::AppError::ManifestNotFound(format!("{repository}:{tag}"))
        })?;

        let reference = format!("{}/{repository}:{tag}", self.external_url);
        let payload = self.signer.sign(&reference, &digest).await?;
        let row = sign::signature_row(&payload, digest, SignatureKind::Atomic, None);
        let row = self.registry.graph.put_signature(row).await;

        let refs = vec![ContentRef::Signature(row.digest.clone())];
        let resource = format!("repository:{repository}");
        let version = self
            .tasks
            .run_reserved("sign", vec![resource], async {
                let manifests = self.registry.graph.manifest_table().await;
                self.registry
                    .update_repository(repository, |repo| {
                        let content = repo::recursive_add(repo.latest(), &refs, &manifests);
                        repo.commit(content)
                    })
                    .await
            })
            .await?;

        self.registry.persist().await;
        info!(%repository, %tag, "signed manifest");
        Ok(version)
    }
}
