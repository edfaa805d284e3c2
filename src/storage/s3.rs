use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use async_trait::async_trait;
use aws_credential_types::provider::{error::CredentialsError, future, ProvideCredentials};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region, SharedCredentialsProvider};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use super::{AfterWrite, BlobReader, Result, Storage, StorageError};
use crate::config::S3Config;
use crate::digest;

const S3_CONTENT_TYPE: &str = "application/binary";
const METADATA_CREDENTIALS_URL: &str =
    "http://169.254.169.254/latest/meta-data/iam/security-credentials/";
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const CREDENTIAL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// S3 backend. Streaming writes are buffered to a local scratch file first
/// because the upload needs a known length; the scratch directory doubles as
/// a single-flight gate against concurrent uploads of the same key.
pub struct S3Storage {
    client: Client,
    bucket: String,
    root: String,
    buffer_dir: BufferDir,
    credentials: Arc<RwLock<StoredCredentials>>,
}

#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

/// Credentials provider reading the process-wide slot under a read lock, so
/// in-flight SDK operations always see a consistent auth while the refresher
/// holds the write side.
#[derive(Clone)]
struct LockedCredentialsProvider {
    credentials: Arc<RwLock<StoredCredentials>>,
}

impl LockedCredentialsProvider {
    async fn load(&self) -> std::result::Result<Credentials, CredentialsError> {
        let creds = self.credentials.read().await;
        if creds.access_key.is_empty() {
            return Err(CredentialsError::not_loaded("no credentials available"));
        }
        Ok(Credentials::new(
            creds.access_key.clone(),
            creds.secret_key.clone(),
            creds.token.clone(),
            creds.expiration.map(SystemTime::from),
            "docker-registry",
        ))
    }
}

impl std::fmt::Debug for LockedCredentialsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockedCredentialsProvider")
    }
}

impl ProvideCredentials for LockedCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(self.load())
    }
}

#[derive(Deserialize)]
struct RoleCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "Token")]
    token: String,
    #[serde(rename = "Expiration")]
    expiration: DateTime<Utc>,
}

/// Fetch role credentials from the EC2 instance metadata service.
async fn fetch_role_credentials(client: &reqwest::Client) -> anyhow::Result<StoredCredentials> {
    let roles = client
        .get(METADATA_CREDENTIALS_URL)
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let role = roles
        .lines()
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .context("no IAM role attached to this instance")?;
    let creds: RoleCredentials = client
        .get(format!("{METADATA_CREDENTIALS_URL}{role}"))
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(StoredCredentials {
        access_key: creds.access_key_id,
        secret_key: creds.secret_access_key,
        token: Some(creds.token),
        expiration: Some(creds.expiration),
    })
}

/// Keeps the credential slot fresh for role-tagged EC2 instances. Static
/// credentials carry no expiration, so this exits immediately for them.
async fn refresh_credentials_loop(credentials: Arc<RwLock<StoredCredentials>>) {
    let http = reqwest::Client::new();
    loop {
        let expiration = credentials.read().await.expiration;
        let Some(expiration) = expiration else {
            return;
        };
        let remaining = expiration - Utc::now();
        match remaining.to_std() {
            Ok(wait) => tokio::time::sleep(wait).await,
            Err(_) => {
                // past expiry, refresh now and retry until it works
                match fetch_role_credentials(&http).await {
                    Ok(fresh) => {
                        *credentials.write().await = fresh;
                    }
                    Err(err) => {
                        log::error!("failed to refresh S3 credentials: {err:#}");
                        tokio::time::sleep(CREDENTIAL_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

impl S3Storage {
    pub async fn new(cfg: S3Config) -> anyhow::Result<Self> {
        if cfg.bucket.is_empty() {
            bail!("please specify an S3 bucket");
        }
        if cfg.region.is_empty() {
            bail!("please specify an S3 region");
        }
        if cfg.root.is_empty() {
            bail!("please specify an S3 root path");
        }
        if cfg.buffer_dir.as_os_str().is_empty() {
            bail!("please specify a buffer directory to use for uploads");
        }

        let initial = if cfg.access_key.is_empty() {
            let http = reqwest::Client::new();
            fetch_role_credentials(&http)
                .await
                .context("no static S3 credentials and EC2 role lookup failed")?
        } else {
            StoredCredentials {
                access_key: cfg.access_key.clone(),
                secret_key: cfg.secret_key.clone(),
                token: None,
                expiration: None,
            }
        };
        let credentials = Arc::new(RwLock::new(initial));

        let provider = LockedCredentialsProvider {
            credentials: credentials.clone(),
        };
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(SharedCredentialsProvider::new(provider))
            .build();
        let client = Client::from_conf(sdk_config);

        tokio::fs::create_dir_all(&cfg.buffer_dir).await?;
        tokio::spawn(refresh_credentials_loop(credentials.clone()));

        Ok(Self {
            client,
            bucket: cfg.bucket,
            root: cfg.root.trim_matches('/').to_string(),
            buffer_dir: BufferDir::new(cfg.buffer_dir),
            credentials,
        })
    }

    pub fn credentials(&self) -> Arc<RwLock<StoredCredentials>> {
        self.credentials.clone()
    }

    fn key(&self, relpath: &str) -> String {
        let relpath = relpath.trim_matches('/');
        if self.root.is_empty() {
            relpath.to_string()
        } else if relpath.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{relpath}", self.root)
        }
    }

    /// Map a bucket key back to the leading-slash name the contract exposes.
    fn name(&self, key: &str) -> String {
        let stripped = key
            .strip_prefix(self.root.as_str())
            .unwrap_or(key)
            .trim_start_matches('/');
        format!("/{stripped}")
    }

    async fn upload_scratch(&self, key: &str, scratch: &Path) -> Result<()> {
        let body = ByteStream::from_path(scratch)
            .await
            .map_err(|e| StorageError::Backend(format!("reading upload buffer: {e}")))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(S3_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()) == Some(true) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(e.to_string())
                }
            })?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .content_type(S3_CONTENT_TYPE)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_reader(&self, key: &str) -> Result<BlobReader> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()) == Some(true) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(e.to_string())
                }
            })?;
        Ok(Box::new(object.body.into_async_read()))
    }

    async fn put_reader(
        &self,
        key: &str,
        mut reader: BlobReader,
        after_write: Option<AfterWrite>,
    ) -> Result<()> {
        let full_key = self.key(key);
        let scratch = self.buffer_dir.reserve(&full_key).await?;

        let buffered: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&scratch)
                .await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            drop(file);
            self.upload_scratch(&full_key, &scratch).await
        }
        .await;

        let result = match buffered {
            Ok(()) => match after_write {
                Some(hook) => {
                    let path = scratch.clone();
                    let joined = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                        let mut file = std::fs::File::open(&path)?;
                        hook(&mut file);
                        Ok(())
                    })
                    .await;
                    match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(StorageError::Io(err)),
                        Err(err) => Err(StorageError::Backend(format!(
                            "after-write hook panicked: {err}"
                        ))),
                    }
                }
                None => Ok(()),
            },
            Err(err) => Err(err),
        };

        self.buffer_dir.release(&scratch).await;
        result
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(format!("{}/", self.key(prefix)))
            .delimiter("/")
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut names = Vec::new();
        for object in result.contents() {
            if let Some(key) = object.key() {
                names.push(self.name(key));
            }
        }
        for common in result.common_prefixes() {
            if let Some(p) = common.prefix() {
                names.push(self.name(p.trim_end_matches('/')));
            }
        }
        if names.is_empty() {
            return Err(StorageError::NotFound(prefix.to_string()));
        }
        Ok(names)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()) == Some(true) {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(e.to_string()))
                }
            }
        }
    }

    async fn size(&self, key: &str) -> Result<i64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_not_found()) == Some(true) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(e.to_string())
                }
            })?;
        Ok(head.content_length().unwrap_or(-1))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove_all(&self, prefix: &str) -> Result<()> {
        let mut removed = 0usize;
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(format!("{}/", self.key(prefix)));
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let result = request
                .send()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            for object in result.contents() {
                if let Some(key) = object.key() {
                    self.client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| StorageError::Backend(e.to_string()))?;
                    removed += 1;
                }
            }
            match result.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        if removed == 0 {
            return Err(StorageError::NotFound(prefix.to_string()));
        }
        // the prefix itself may exist as a plain object
        let _ = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(prefix))
            .send()
            .await;
        Ok(())
    }
}

/// Scratch directory shared by concurrent uploads. A scratch file is named by
/// the SHA-256 of its key; the probe-and-create runs under the mutex so at
/// most one upload per key is in flight.
pub struct BufferDir {
    root: PathBuf,
    lock: Mutex<()>,
}

impl BufferDir {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            lock: Mutex::new(()),
        }
    }

    /// Claim the scratch file for `key`, creating it. Fails immediately when
    /// another upload of the same key holds the claim.
    pub async fn reserve(&self, key: &str) -> Result<PathBuf> {
        let path = self.root.join(digest::sha256_hex(key.as_bytes()));
        let _guard = self.lock.lock().await;
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::UploadInProgress(key.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Release the claim, deleting the scratch file.
    pub async fn release(&self, path: &Path) {
        let _guard = self.lock.lock().await;
        if let Err(err) = tokio::fs::remove_file(path).await {
            log::warn!("failed to remove upload buffer {}: {err}", path.display());
        }
    }
}
