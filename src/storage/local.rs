use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{AfterWrite, BlobReader, Result, Storage, StorageError};
use crate::config::LocalConfig;

/// Filesystem backend rooted at a configured directory.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub async fn new(cfg: LocalConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&cfg.root).await?;
        Ok(Self { root: cfg.root })
    }

    fn abspath(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    async fn create_parents(&self, abspath: &Path) -> Result<()> {
        if let Some(parent) = abspath.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Walk upward from `abspath`'s parent removing now-empty directories, so
    /// the filesystem mirrors the flat keyspace of S3. Stops at the root.
    async fn prune_empty_parents(&self, abspath: &Path) {
        let mut dir = abspath.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            if !remove_if_empty(&current).await {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
    }
}

async fn remove_if_empty(dir: &Path) -> bool {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    match entries.next_entry().await {
        Ok(None) => tokio::fs::remove_dir(dir).await.is_ok(),
        _ => false,
    }
}

fn io_err(key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.abspath(key))
            .await
            .map_err(|e| io_err(key, e))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let abspath = self.abspath(key);
        self.create_parents(&abspath).await?;
        tokio::fs::write(&abspath, data).await?;
        Ok(())
    }

    async fn get_reader(&self, key: &str) -> Result<BlobReader> {
        let file = tokio::fs::File::open(self.abspath(key))
            .await
            .map_err(|e| io_err(key, e))?;
        Ok(Box::new(file))
    }

    async fn put_reader(
        &self,
        key: &str,
        mut reader: BlobReader,
        after_write: Option<AfterWrite>,
    ) -> Result<()> {
        let abspath = self.abspath(key);
        self.create_parents(&abspath).await?;
        let mut file = tokio::fs::File::create(&abspath).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);

        if let Some(hook) = after_write {
            let path = abspath.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let mut file = std::fs::File::open(&path)?;
                hook(&mut file);
                Ok(())
            })
            .await
            .map_err(|e| StorageError::Backend(format!("after-write hook panicked: {e}")))??;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let abspath = self.abspath(prefix);
        let mut entries = tokio::fs::read_dir(&abspath)
            .await
            .map_err(|e| io_err(prefix, e))?;
        let base = prefix.trim_matches('/');
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if base.is_empty() {
                names.push(format!("/{name}"));
            } else {
                names.push(format!("/{base}/{name}"));
            }
        }
        if names.is_empty() {
            // consistent with S3: an empty prefix does not exist
            return Err(StorageError::NotFound(prefix.to_string()));
        }
        Ok(names)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match tokio::fs::metadata(self.abspath(key)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn size(&self, key: &str) -> Result<i64> {
        let meta = tokio::fs::metadata(self.abspath(key))
            .await
            .map_err(|e| io_err(key, e))?;
        Ok(meta.len() as i64)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let abspath = self.abspath(key);
        tokio::fs::remove_file(&abspath)
            .await
            .map_err(|e| io_err(key, e))?;
        self.prune_empty_parents(&abspath).await;
        Ok(())
    }

    async fn remove_all(&self, prefix: &str) -> Result<()> {
        let abspath = self.abspath(prefix);
        let meta = tokio::fs::metadata(&abspath)
            .await
            .map_err(|e| io_err(prefix, e))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&abspath).await?;
        } else {
            tokio::fs::remove_file(&abspath).await?;
        }
        self.prune_empty_parents(&abspath).await;
        Ok(())
    }
}
