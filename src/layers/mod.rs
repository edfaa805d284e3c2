//! Stateful operations spanning multiple image blobs: checksums, ancestry
//! chains, the repository image index, file inventories and ancestry diffs.

pub mod tar;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::storage::{paths, Storage, StorageError};
use self::tar::{TarError, TarFilesInfo, TAR_FILES_INFO_SIZE};

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("unsupported layer format: {0}")]
    Tar(#[from] TarError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid checksum format: {0}")]
    InvalidChecksum(String),
    #[error("invalid data")]
    InvalidData,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Persist `checksums` to the image's checksum blob as a JSON array. Each
/// entry must look like `<algorithm>:<hex>`.
pub async fn store_checksum(
    storage: &dyn Storage,
    image_id: &str,
    checksums: &[String],
) -> Result<()> {
    for checksum in checksums {
        let mut parts = checksum.splitn(2, ':');
        let algorithm = parts.next().unwrap_or_default();
        let hex = parts.next().unwrap_or_default();
        if algorithm.is_empty() || hex.is_empty() {
            return Err(LayerError::InvalidChecksum(checksum.clone()));
        }
    }
    let content = serde_json::to_vec(checksums)?;
    storage
        .put(&paths::image_checksum_path(image_id), &content)
        .await?;
    Ok(())
}

/// Write the image's ancestry: `[id]` for a root image, otherwise the parent
/// ancestry with `id` prepended.
pub async fn generate_ancestry(
    storage: &dyn Storage,
    image_id: &str,
    parent_id: Option<&str>,
) -> Result<()> {
    log::debug!("generating ancestry for image {image_id} (parent {parent_id:?})");
    let path = paths::image_ancestry_path(image_id);
    let Some(parent_id) = parent_id.filter(|p| !p.is_empty()) else {
        let content = serde_json::to_vec(&[image_id])?;
        storage.put(&path, &content).await?;
        return Ok(());
    };
    let content = storage
        .get(&paths::image_ancestry_path(parent_id))
        .await?;
    let mut ancestry: Vec<String> = serde_json::from_slice(&content)?;
    ancestry.insert(0, image_id.to_string());
    let content = serde_json::to_vec(&ancestry)?;
    storage.put(&path, &content).await?;
    Ok(())
}

/// Merge `additional` into the repository's index-images blob. Entries are
/// keyed by `id`; an incoming entry wins unless the stored one already
/// carries a checksum, in which case the stored entry is preserved.
pub async fn update_index_images(
    storage: &dyn Storage,
    namespace: &str,
    repo: &str,
    additional_bytes: &[u8],
    additional: &[Value],
) -> Result<()> {
    let path = paths::repo_index_images_path(namespace, repo);
    let previous_data = match storage.get(&path).await {
        Ok(data) => data,
        Err(_) => {
            // no index yet, store the incoming data as-is
            storage.put(&path, additional_bytes).await?;
            return Ok(());
        }
    };
    let previous: Vec<Value> = serde_json::from_slice(&previous_data)?;
    if previous.is_empty() {
        storage.put(&path, additional_bytes).await?;
        return Ok(());
    }

    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Value> = HashMap::new();
    for value in additional {
        let id = entry_id(value)?;
        if !merged.contains_key(&id) {
            order.push(id.clone());
        }
        merged.insert(id, value.clone());
    }
    for value in &previous {
        let id = entry_id(value)?;
        let has_checksum = value.get("checksum").is_some();
        match merged.get(&id) {
            Some(_) if has_checksum => {
                // the stored checksum outlives a checksum-less re-push
                merged.insert(id, value.clone());
            }
            Some(_) => {}
            None => {
                order.push(id.clone());
                merged.insert(id, value.clone());
            }
        }
    }
    let images: Vec<Value> = order
        .iter()
        .filter_map(|id| merged.remove(id))
        .collect();
    let data = serde_json::to_vec(&images)?;
    storage.put(&path, &data).await?;
    Ok(())
}

fn entry_id(value: &Value) -> Result<String> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(LayerError::InvalidData)
}

pub async fn get_image_files_cache(storage: &dyn Storage, image_id: &str) -> Result<Vec<u8>> {
    Ok(storage.get(&paths::image_files_path(image_id)).await?)
}

pub async fn set_image_files_cache(
    storage: &dyn Storage,
    image_id: &str,
    files_json: &[u8],
) -> Result<()> {
    storage
        .put(&paths::image_files_path(image_id), files_json)
        .await?;
    Ok(())
}

/// File inventory for an image. Served from the `_files` cache when present;
/// otherwise the layer is streamed to a scratch file and walked. The cache is
/// only ever populated at push time, not here.
pub async fn get_image_files_json(storage: &dyn Storage, image_id: &str) -> Result<Vec<u8>> {
    if let Ok(cached) = get_image_files_cache(storage, image_id).await {
        return Ok(cached);
    }

    let mut reader = storage
        .get_reader(&paths::image_layer_path(image_id))
        .await?;
    let scratch = tempfile::NamedTempFile::new().map_err(LayerError::Io)?;
    let mut file = tokio::fs::File::create(scratch.path())
        .await
        .map_err(LayerError::Io)?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(LayerError::Io)?;
    file.flush().await.map_err(LayerError::Io)?;
    drop(file);

    let path = scratch.path().to_path_buf();
    let files_json = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut file = std::fs::File::open(&path).map_err(LayerError::Io)?;
        let mut files = TarFilesInfo::new();
        files.load_seekable(&mut file)?;
        Ok(files.json()?)
    })
    .await
    .map_err(|e| LayerError::Storage(StorageError::Backend(format!("tar walk panicked: {e}"))))??;
    Ok(files_json)
}

pub async fn get_image_diff_cache(
    storage: &dyn Storage,
    image_id: &str,
) -> Result<Option<Vec<u8>>> {
    let path = paths::image_diff_path(image_id);
    if storage.exists(&path).await.unwrap_or(false) {
        return Ok(Some(storage.get(&path).await?));
    }
    // a miss is not an error, the caller kicks off generation
    Ok(None)
}

pub async fn set_image_diff_cache(
    storage: &dyn Storage,
    image_id: &str,
    diff_json: &[u8],
) -> Result<()> {
    storage
        .put(&paths::image_diff_path(image_id), diff_json)
        .await?;
    Ok(())
}

/// Compute the per-ancestor file diff for an image and cache it. Dispatched
/// as a background task; every failure is logged and swallowed so a later
/// request simply retries.
///
/// Classification, walking the ancestry from the image backwards:
/// - file tombstoned in this layer:          deleted
/// - ancestor has the file, not tombstoned:  changed
/// - ancestor has the file tombstoned:       created
/// - no ancestor has the file:               created
pub async fn gen_diff(storage: Arc<dyn Storage>, image_id: String) {
    match get_image_diff_cache(storage.as_ref(), &image_id).await {
        Ok(Some(_)) => {
            log::debug!("diff for {image_id} already exists");
            return;
        }
        Ok(None) => {}
        Err(err) => {
            log::error!("error reading diff cache for {image_id}: {err}");
            return;
        }
    }

    let ancestry_data = match storage.get(&paths::image_ancestry_path(&image_id)).await {
        Ok(data) => data,
        Err(err) => {
            log::error!("error fetching ancestry for {image_id}: {err}");
            return;
        }
    };
    let ancestry: Vec<String> = match serde_json::from_slice(&ancestry_data) {
        Ok(ancestry) => ancestry,
        Err(err) => {
            log::error!("error decoding ancestry for {image_id}: {err}");
            return;
        }
    };

    let mut info_map = match file_info_map(storage.as_ref(), &image_id).await {
        Ok(map) => map,
        Err(err) => {
            log::error!("error getting file info for {image_id}: {err}");
            return;
        }
    };

    let mut deleted: HashMap<String, Vec<Value>> = HashMap::new();
    let mut changed: HashMap<String, Vec<Value>> = HashMap::new();
    let mut created: HashMap<String, Vec<Value>> = HashMap::new();

    // tombstones in this layer are deletions no matter what the ancestors say
    info_map.retain(|name, info| {
        if is_deleted(info) {
            deleted.insert(name.clone(), info.clone());
            false
        } else {
            true
        }
    });

    // the head of the ancestry is the image itself, compare against the rest
    for ancestor_id in ancestry.iter().skip(1) {
        let ancestor_map = match file_info_map(storage.as_ref(), ancestor_id).await {
            Ok(map) => map,
            Err(err) => {
                log::error!("error getting file info for ancestor {ancestor_id}: {err}");
                return;
            }
        };
        info_map.retain(|name, info| {
            let Some(ancestor_info) = ancestor_map.get(name) else {
                return true;
            };
            if is_deleted(ancestor_info) {
                created.insert(name.clone(), info.clone());
            } else {
                changed.insert(name.clone(), info.clone());
            }
            false
        });
    }

    // whatever no ancestor accounted for was created here
    for (name, info) in info_map {
        created.insert(name, info);
    }

    let diff = serde_json::json!({
        "deleted": deleted,
        "changed": changed,
        "created": created,
    });
    let diff_json = match serde_json::to_vec(&diff) {
        Ok(json) => json,
        Err(err) => {
            log::error!("error encoding diff for {image_id}: {err}");
            return;
        }
    };
    if let Err(err) = set_image_diff_cache(storage.as_ref(), &image_id, &diff_json).await {
        log::error!("error writing diff cache for {image_id}: {err}");
    }
}

/// `true` when a file-info tuple (name stripped) is tombstoned. A malformed
/// flag counts as deleted.
fn is_deleted(info: &[Value]) -> bool {
    match info.get(1) {
        Some(Value::Bool(deleted)) => *deleted,
        _ => {
            log::error!("file info tuple has a malformed deleted flag");
            true
        }
    }
}

/// Map of file name to the remaining 7 fields of its inventory tuple.
async fn file_info_map(
    storage: &dyn Storage,
    image_id: &str,
) -> Result<HashMap<String, Vec<Value>>> {
    let content = get_image_files_json(storage, image_id).await?;
    let rows: Vec<Vec<Value>> = serde_json::from_slice(&content)?;
    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        if row.len() != TAR_FILES_INFO_SIZE {
            continue;
        }
        if let Some(name) = row[0].as_str() {
            map.insert(name.to_string(), row[1..].to_vec());
        }
    }
    Ok(map)
}
