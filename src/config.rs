use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/docker-registry/config.json";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address, `":5000"` style (host part optional).
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Headers attached to every response before per-handler headers.
    #[serde(default)]
    pub default_headers: HashMap<String, Vec<String>>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            default_headers: HashMap::new(),
        }
    }
}

fn default_addr() -> String {
    ":5000".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default = "default_storage_type")]
    pub kind: String,
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            local: Some(LocalConfig {
                root: PathBuf::from("/tmp/registry"),
            }),
            s3: None,
        }
    }
}

fn default_storage_type() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub buffer_dir: PathBuf,
    /// Empty access/secret keys enable EC2-role credentials.
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = Config::default();
            log::warn!(
                "could not find config file {}, using defaults: addr={} storage={}",
                path.display(),
                cfg.api.addr,
                cfg.storage.kind
            );
            return Ok(cfg);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
