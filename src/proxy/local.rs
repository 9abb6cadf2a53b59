use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::HeaderMap;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

use super::entry::{self, DecodeError};

/// Result of a local-tier read. Corruption is deliberately distinct from
/// absence so the resolver can log it; both fall through as misses.
#[derive(Debug)]
pub enum LoadOutcome {
    Hit(HeaderMap, Bytes),
    Missing,
    Corrupt(DecodeError),
}

/// Content-addressed file store rooted at a directory. Entries live at
/// `<root>/<hash[0..2]>/<hash>`; the two-character prefix fans entries out
/// across 256 shard directories. Writes are temp-file-plus-rename so readers
/// never observe a partial entry, and nothing here ever deletes an entry.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root {}", root.display()))?;
        let cache = Self { root };
        cache.remove_temp_files()?;
        Ok(cache)
    }

    pub fn entry_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(hash)
    }

    pub async fn load(&self, hash: &str) -> Result<LoadOutcome> {
        let path = self.entry_path(hash);
        let data = match async_fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LoadOutcome::Missing),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read cache entry {}", path.display()));
            }
        };
        match entry::decode(&data) {
            Ok((headers, body)) => Ok(LoadOutcome::Hit(headers, body)),
            Err(err) => Ok(LoadOutcome::Corrupt(err)),
        }
    }

    pub async fn store(&self, hash: &str, headers: &HeaderMap, body: &[u8]) -> Result<()> {
        let final_path = self.entry_path(hash);
        let shard_dir = self.root.join(&hash[..2]);
        async_fs::create_dir_all(&shard_dir)
            .await
            .with_context(|| format!("failed to create cache shard {}", shard_dir.display()))?;

        let temp_path = shard_dir.join(format!("tmp_{}", uuid::Uuid::new_v4()));
        let data = entry::encode(headers, body);
        let mut file = async_fs::File::create(&temp_path)
            .await
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        if let Err(err) = write_and_flush(&mut file, &data).await {
            drop(file);
            async_fs::remove_file(&temp_path).await.ok();
            return Err(err)
                .with_context(|| format!("failed to write cache entry {}", final_path.display()));
        }
        drop(file);

        async_fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("failed to publish cache entry {}", final_path.display()))
    }

    /// Removes temp files orphaned by a previous crash. Runs once at startup.
    fn remove_temp_files(&self) -> Result<()> {
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                remove_if_temp(&shard.path());
                continue;
            }
            for file in fs::read_dir(shard.path())? {
                remove_if_temp(&file?.path());
            }
        }
        Ok(())
    }
}

fn remove_if_temp(path: &Path) {
    let is_temp = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("tmp_"))
        .unwrap_or(false);
    if is_temp {
        fs::remove_file(path).ok();
    }
}

async fn write_and_flush(file: &mut async_fs::File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}
