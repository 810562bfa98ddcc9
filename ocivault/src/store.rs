use std::time::Duration;

use bytes::Bytes;
use opendal::services::Fs;
use opendal::services::S3;
use opendal::Operator;
use sha2::{Digest, Sha256};

use ociclient::{DigestAlgorithm, OciDigest};

use crate::config::{AppConfig, StorageBackend};
use crate::error::{AppError, Result};

const META_PATH: &str = "meta/registry.json";

/// Content-addressed byte store over an opendal operator.
///
/// Raw bytes live under `<algo>/<first2hex>/<rest>`; upload sessions stage
/// their chunks under `uploads/` until commit.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    operator: Operator,
    redirect: bool,
}

impl ObjectStore {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let operator = match config.storage.backend {
            StorageBackend::Fs => {
                let root = config.storage.fs_root.clone().ok_or_else(|| {
                    AppError::Config("Missing fs_root configuration".to_string())
                })?;

                let mut builder = Fs::default();
                builder.root(&root.to_string_lossy());

                Operator::new(builder)
                    .map_err(AppError::Storage)?
                    .finish()
            }
            StorageBackend::S3 => {
                let bucket = config.storage.s3_bucket.clone().ok_or_else(|| {
                    AppError::Config("Missing s3_bucket configuration".to_string())
                })?;
                let region = config.storage.s3_region.clone().ok_or_else(|| {
                    AppError::Config("Missing s3_region configuration".to_string())
                })?;

                let mut builder = S3::default();
                builder.bucket(&bucket);
                builder.region(&region);

                if let Some(endpoint) = &config.storage.s3_endpoint {
                    builder.endpoint(endpoint);
                }
                if let Some(access_key) = &config.storage.s3_access_key {
                    builder.access_key_id(access_key);
                }
                if let Some(secret_key) = &config.storage.s3_secret_key {
                    builder.secret_access_key(secret_key);
                }

                Operator::new(builder)
                    .map_err(AppError::Storage)?
                    .finish()
            }
        };

        Ok(Self {
            operator,
            redirect: config.storage.redirect,
        })
    }

    fn content_path(digest: &OciDigest) -> String {
        let hex = digest.hex();
        format!("{}/{}/{}", digest.algorithm(), &hex[..2], &hex[2..])
    }

    // Content operations

    pub async fn exists(&self, digest: &OciDigest) -> Result<bool> {
        self.operator
            .is_exist(&Self::content_path(digest))
            .await
            .map_err(AppError::Storage)
    }

    pub async fn read(&self, digest: &OciDigest) -> Result<Bytes> {
        let data = self
            .operator
            .read(&Self::content_path(digest))
            .await
            .map_err(AppError::Storage)?;
        Ok(Bytes::from(data))
    }

    pub async fn size(&self, digest: &OciDigest) -> Result<u64> {
        let metadata = self
            .operator
            .stat(&Self::content_path(digest))
            .await
            .map_err(AppError::Storage)?;
        Ok(metadata.content_length())
    }

    pub async fn delete(&self, digest: &OciDigest) -> Result<()> {
        self.operator
            .delete(&Self::content_path(digest))
            .await
            .map_err(AppError::Storage)
    }

    /// Store bytes under their sha256 address, plus any extra algorithms.
    ///
    /// Concurrent puts of the same content converge on the same keys, so a
    /// lost race is harmless.
    pub async fn put_bytes(
        &self,
        content: Bytes,
        extra: &[DigestAlgorithm],
    ) -> Result<(OciDigest, Vec<OciDigest>)> {
        let digest = OciDigest::sha256_of(&content);
        let alternates: Vec<OciDigest> = extra
            .iter()
            .filter(|algo| **algo != DigestAlgorithm::Sha256)
            .map(|algo| OciDigest::digest_of(*algo, &content))
            .collect();

        if !self.exists(&digest).await? {
            self.operator
                .write(&Self::content_path(&digest), content.clone())
                .await
                .map_err(AppError::Storage)?;
        }
        for alternate in &alternates {
            if !self.operator.is_exist(&Self::content_path(alternate)).await? {
                self.operator
                    .write(&Self::content_path(alternate), content.clone())
                    .await
                    .map_err(AppError::Storage)?;
            }
        }
        Ok((digest, alternates))
    }

    /// Store bytes under an externally computed address.
    ///
    /// Schema-1 manifests hash differently from their raw bytes, so their
    /// storage key cannot be derived here.
    pub async fn put_bytes_at(&self, digest: &OciDigest, content: Bytes) -> Result<()> {
        if !self.exists(digest).await? {
            self.operator
                .write(&Self::content_path(digest), content)
                .await
                .map_err(AppError::Storage)?;
        }
        Ok(())
    }

    /// Presigned read URL, when the backend supports it and redirects are on.
    ///
    /// The URL is returned exactly as the backend encoded it; rewriting it
    /// breaks request signing.
    pub async fn presign(&self, digest: &OciDigest, ttl: Duration) -> Option<String> {
        if !self.redirect {
            return None;
        }
        self.operator
            .presign_read(&Self::content_path(digest), ttl)
            .await
            .ok()
            .map(|req| req.uri().to_string())
    }

    // Upload staging

    fn chunk_path(uuid: &str, offset: u64) -> String {
        format!("uploads/{uuid}/chunks/{offset:020}")
    }

    pub async fn stage_chunk(&self, uuid: &str, offset: u64, content: Bytes) -> Result<()> {
        self.operator
            .write(&Self::chunk_path(uuid, offset), content)
            .await
            .map_err(AppError::Storage)
    }

    /// Concatenate staged chunks, hash them, and commit the result under its
    /// content address. Memory stays bounded by the chunk size.
    pub async fn commit_staged(
        &self,
        uuid: &str,
        offsets: &[u64],
        extra: &[DigestAlgorithm],
    ) -> Result<(OciDigest, u64, Vec<OciDigest>)> {
        let scratch = format!("uploads/{uuid}/commit");
        let mut writer = self
            .operator
            .writer(&scratch)
            .await
            .map_err(AppError::Storage)?;
        let mut hasher = Sha256::new();
        let mut extra_hashers: Vec<(DigestAlgorithm, Box<dyn sha2::digest::DynDigest + Send>)> =
            extra
                .iter()
                .filter(|algo| **algo != DigestAlgorithm::Sha256)
                .map(|algo| {
                    let hasher: Box<dyn sha2::digest::DynDigest + Send> = match algo {
                        DigestAlgorithm::Sha224 => Box::new(sha2::Sha224::new()),
                        DigestAlgorithm::Sha512 => Box::new(sha2::Sha512::new()),
                        DigestAlgorithm::Sha256 => unreachable!(),
                    };
                    (*algo, hasher)
                })
                .collect();
        let mut total = 0u64;

        for offset in offsets {
            let chunk = self
                .operator
                .read(&Self::chunk_path(uuid, *offset))
                .await
                .map_err(AppError::Storage)?;
            hasher.update(&chunk);
            for (_, extra_hasher) in extra_hashers.iter_mut() {
                extra_hasher.update(&chunk);
            }
            total += chunk.len() as u64;
            writer.write(chunk).await.map_err(AppError::Storage)?;
        }
        writer.close().await.map_err(AppError::Storage)?;

        let digest = OciDigest::new(DigestAlgorithm::Sha256, hex::encode(hasher.finalize()));
        if !self.exists(&digest).await? {
            self.operator
                .copy(&scratch, &Self::content_path(&digest))
                .await
                .map_err(AppError::Storage)?;
        }
        let mut alternates = Vec::new();
        for (algo, extra_hasher) in extra_hashers {
            let alternate = OciDigest::new(algo, hex::encode(extra_hasher.finalize()));
            if !self.operator.is_exist(&Self::content_path(&alternate)).await? {
                self.operator
                    .copy(&scratch, &Self::content_path(&alternate))
                    .await
                    .map_err(AppError::Storage)?;
            }
            alternates.push(alternate);
        }
        self.operator.delete(&scratch).await.map_err(AppError::Storage)?;

        Ok((digest, total, alternates))
    }

    pub async fn discard_staged(&self, uuid: &str) -> Result<()> {
        let prefix = format!("uploads/{uuid}/chunks/");
        if self.operator.is_exist(&prefix).await.unwrap_or(false) {
            let entries = self
                .operator
                .list(&prefix)
                .await
                .map_err(AppError::Storage)?;
            for entry in entries {
                self.operator
                    .delete(&format!("{}{}", prefix, entry.name()))
                    .await
                    .map_err(AppError::Storage)?;
            }
        }
        Ok(())
    }

    // Metadata snapshot

    pub async fn load_meta(&self) -> Result<Option<Bytes>> {
        if !self.operator.is_exist(META_PATH).await.map_err(AppError::Storage)? {
            return Ok(None);
        }
        let data = self.operator.read(META_PATH).await.map_err(AppError::Storage)?;
        Ok(Some(Bytes::from(data)))
    }

    pub async fn save_meta(&self, data: Bytes) -> Result<()> {
        self.operator
            .write(META_PATH, data)
            .await
            .map_err(AppError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    async fn fs_store(root: &std::path::Path) -> ObjectStore {
        let config = AppConfig {
            storage: crate::config::StorageConfig {
                fs_root: Some(root.to_path_buf()),
                ..Default::default()
            },
            ..Default::default()
        };
        ObjectStore::new(&config).await.unwrap()
    }

    #[test]
    fn content_paths_shard_on_first_two_hex_chars() {
        let digest = OciDigest::from_str(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();
        assert_eq!(
            ObjectStore::content_path(&digest),
            "sha256/e3/b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn put_and_read_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ocivault-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = fs_store(&dir).await;

        let content = Bytes::from_static(b"layer bytes");
        let (digest, _) = store.put_bytes(content.clone(), &[]).await.unwrap();
        assert_eq!(digest, OciDigest::sha256_of(&content));
        assert!(store.exists(&digest).await.unwrap());
        assert_eq!(store.read(&digest).await.unwrap(), content);

        // A duplicate put leaves exactly one stored object.
        let (again, _) = store.put_bytes(content.clone(), &[]).await.unwrap();
        assert_eq!(again, digest);
        assert_eq!(store.size(&digest).await.unwrap(), content.len() as u64);
    }

    #[tokio::test]
    async fn staged_chunks_commit_to_content_address() {
        let dir = std::env::temp_dir().join(format!("ocivault-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = fs_store(&dir).await;

        store
            .stage_chunk("u1", 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        store
            .stage_chunk("u1", 6, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let (digest, size, _) = store.commit_staged("u1", &[0, 6], &[]).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(digest, OciDigest::sha256_of(b"hello world"));
        assert_eq!(store.read(&digest).await.unwrap(), Bytes::from_static(b"hello world"));
        store.discard_staged("u1").await.unwrap();
    }
}
