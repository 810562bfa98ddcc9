//! Shared response cache for manifest reads.
//!
//! Keys incorporate the bearer's scope so cached entries can never leak
//! across tenants. Mutations invalidate by path prefix.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub bytes: Bytes,
    pub media_type: String,
    pub digest: String,
}

#[derive(Debug)]
pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, CachedManifest)>>,
}

impl ResponseCache {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            enabled: config.registry.cache_enabled,
            ttl: Duration::from_secs(config.registry.cache_ttl_seconds),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cache key for a manifest response, scoped to the caller's grants.
    pub fn key(path: &str, reference: &str, scope_fingerprint: &str) -> String {
        format!("{path}\u{1f}{reference}\u{1f}{scope_fingerprint}")
    }

    pub async fn get(&self, key: &str) -> Option<CachedManifest> {
        if !self.enabled {
            return None;
        }
        let entries = self.entries.read().await;
        let (stored_at, entry) = entries.get(key)?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    pub async fn put(&self, key: String, entry: CachedManifest) {
        if !self.enabled {
            return;
        }
        self.entries
            .write()
            .await
            .insert(key, (Instant::now(), entry));
    }

    /// Drop every entry below a repository path. Called on any mutation of
    /// that repository.
    pub async fn invalidate_path(&self, path: &str) {
        if !self.enabled {
            return;
        }
        let prefix = format!("{path}\u{1f}");
        self.entries
            .write()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn enabled_cache() -> ResponseCache {
        let mut config = AppConfig::default();
        config.registry.cache_enabled = true;
        ResponseCache::new(&config)
    }

    fn entry(digest: &str) -> CachedManifest {
        CachedManifest {
            bytes: Bytes::from_static(b"{}"),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            digest: digest.to_string(),
        }
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let cache = ResponseCache::new(&AppConfig::default());
        let key = ResponseCache::key("alice/img", "v1", "anon");
        cache.put(key.clone(), entry("sha256:a")).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn scope_is_part_of_the_key() {
        let cache = enabled_cache();
        let for_alice = ResponseCache::key("alice/img", "v1", "alice:pull");
        cache.put(for_alice.clone(), entry("sha256:a")).await;
        assert!(cache.get(&for_alice).await.is_some());
        // A different bearer scope misses.
        let for_anon = ResponseCache::key("alice/img", "v1", "anon");
        assert!(cache.get(&for_anon).await.is_none());
    }

    #[tokio::test]
    async fn invalidation_is_path_scoped() {
        let cache = enabled_cache();
        let a = ResponseCache::key("alice/img", "v1", "s");
        let b = ResponseCache::key("bob/img", "v1", "s");
        cache.put(a.clone(), entry("sha256:a")).await;
        cache.put(b.clone(), entry("sha256:b")).await;
        cache.invalidate_path("alice/img").await;
        assert!(cache.get(&a).await.is_none());
        assert!(cache.get(&b).await.is_some());
    }
}
