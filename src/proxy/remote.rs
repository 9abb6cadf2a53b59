use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::fs as async_fs;

use super::entry;
use super::local::LoadOutcome;

/// Minimal blob-store surface the remote tier needs. A production deployment
/// implements this over an S3-compatible client; provider-specific signing
/// workarounds belong behind this trait, not in the cache.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}

/// Content-addressed view of the object store, sharing the local tier's
/// two-character fan-out in its key layout. The adapter does not retry;
/// retry policy, if any, lives in the client behind [`ObjectStore`].
#[derive(Clone)]
pub struct RemoteCache {
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
}

impl RemoteCache {
    pub fn new(store: Arc<dyn ObjectStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn object_key(&self, hash: &str) -> String {
        if self.key_prefix.is_empty() {
            format!("{}/{}", &hash[..2], hash)
        } else {
            format!("{}/{}/{}", self.key_prefix, &hash[..2], hash)
        }
    }

    pub async fn load(&self, hash: &str) -> Result<LoadOutcome> {
        let key = self.object_key(hash);
        let Some(data) = self.store.get(&key).await? else {
            return Ok(LoadOutcome::Missing);
        };
        match entry::decode(&data) {
            Ok((headers, body)) => Ok(LoadOutcome::Hit(headers, body)),
            Err(err) => Ok(LoadOutcome::Corrupt(err)),
        }
    }

    pub async fn store(&self, hash: &str, headers: &HeaderMap, body: &[u8]) -> Result<()> {
        let key = self.object_key(hash);
        self.store
            .put(&key, Bytes::from(entry::encode(headers, body)))
            .await
    }
}

/// Directory-backed [`ObjectStore`]. Lets the proxy run stand-alone (and the
/// integration tests exercise real fault-in) without an S3 endpoint; keys
/// map to nested paths under the root and writes are temp-plus-rename.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create object store root {}", root.display()))?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(key);
        match async_fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read object {}", path.display()))
            }
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(key);
        let parent = path
            .parent()
            .context("object key resolves to the store root")?;
        async_fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let temp_path = parent.join(format!("tmp_{}", uuid::Uuid::new_v4()));
        async_fs::write(&temp_path, &data)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        async_fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("failed to publish object {}", path.display()))
    }
}
