use std::io::{Read, Seek};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod local;
pub mod paths;
pub mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

/// Reader handed to an [`AfterWrite`] hook: the just-written blob, seekable,
/// positioned at offset 0. Runs on a blocking thread.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Hook invoked exactly once after a successful `put_reader`, before the call
/// returns to the caller.
pub type AfterWrite = Box<dyn FnOnce(&mut dyn ReadSeek) + Send + 'static>;

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no such key: {0}")]
    NotFound(String),
    #[error("upload already in progress for key {0}")]
    UploadInProgress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Uniform key-addressed blob store. Keys are `/`-separated strings; both
/// backends treat them as hierarchical for `list`. A leading slash on a key
/// is accepted and ignored.
///
/// `list` reports an empty result as [`StorageError::NotFound`], never as an
/// empty vector.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    async fn get_reader(&self, key: &str) -> Result<BlobReader>;

    /// Stream `reader` to `key`. After the bytes have been flushed to durable
    /// storage, the just-written blob is reopened and `after_write` is invoked
    /// with a seekable reader over it, exactly once, before this returns.
    async fn put_reader(
        &self,
        key: &str,
        reader: BlobReader,
        after_write: Option<AfterWrite>,
    ) -> Result<()>;

    /// Direct children of `prefix`, each with a leading slash.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn size(&self, key: &str) -> Result<i64>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn remove_all(&self, prefix: &str) -> Result<()>;
}

pub async fn from_config(cfg: &crate::config::StorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    match cfg.kind.as_str() {
        "local" => {
            let local = cfg
                .local
                .as_ref()
                .context("no config for storage type 'local' found")?;
            Ok(Arc::new(LocalStorage::new(local.clone()).await?))
        }
        "s3" => {
            let s3 = cfg
                .s3
                .as_ref()
                .context("no config for storage type 's3' found")?;
            Ok(Arc::new(S3Storage::new(s3.clone()).await?))
        }
        other => bail!("invalid storage type: {other}"),
    }
}
