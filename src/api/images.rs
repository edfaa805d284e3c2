//! Image handlers: the multi-request push protocol (JSON, layer, checksum)
//! and the cache-gated pull endpoints.

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio_util::io::StreamReader;

use super::caching::default_cache_headers;
use super::{user_agent, Payload, RegistryApi};
use crate::digest::to_hex;
use crate::layers::tar::TarInfo;
use crate::layers::{self, LayerError};
use crate::storage::{paths, AfterWrite, BlobReader, StorageError};

const CHECKSUM_COOKIE: &str = "checksum";
const COOKIE_SEPARATOR: &str = "|";

pub async fn get_image_layer(api: &RegistryApi, image_id: &str) -> Response {
    let reader = match api
        .storage
        .get_reader(&paths::image_layer_path(image_id))
        .await
    {
        Ok(reader) => reader,
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Image not found: {err}")),
                StatusCode::NOT_FOUND,
                Vec::new(),
            )
        }
    };
    api.respond(Payload::Stream(reader), StatusCode::OK, default_cache_headers())
}

pub async fn put_image_layer(api: &RegistryApi, image_id: &str, body: Body) -> Response {
    let json_content = match api.storage.get(&paths::image_json_path(image_id)).await {
        Ok(content) => content,
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Image not found: {err}")),
                StatusCode::NOT_FOUND,
                Vec::new(),
            )
        }
    };
    let layer_path = paths::image_layer_path(image_id);
    let mark_path = paths::image_mark_path(image_id);
    let layer_exists = api.storage.exists(&layer_path).await.unwrap_or(false);
    let mark_exists = api.storage.exists(&mark_path).await.unwrap_or(false);
    if layer_exists && !mark_exists {
        return api.respond(
            Payload::Text("Image already exists".to_string()),
            StatusCode::CONFLICT,
            Vec::new(),
        );
    }

    // The body is streamed straight into storage while a tee computes
    // sha256(json || layer). The tar walk runs on the stored bytes through
    // the backend's after-write hook, so one client pass feeds all three.
    let hasher = Arc::new(Mutex::new({
        let mut sha = Sha256::new();
        sha.update(&json_content);
        sha
    }));
    let tee = hasher.clone();
    let stream = body.into_data_stream().map(move |chunk| match chunk {
        Ok(chunk) => {
            tee.lock().unwrap().update(&chunk);
            Ok(chunk)
        }
        Err(err) => Err(std::io::Error::other(err)),
    });
    let reader: BlobReader = Box::new(StreamReader::new(stream));

    let tar_info = Arc::new(Mutex::new(TarInfo::new()));
    let hook_info = tar_info.clone();
    let hook: AfterWrite = Box::new(move |file| {
        hook_info.lock().unwrap().load(file);
    });

    if let Err(err) = api.storage.put_reader(&layer_path, reader, Some(hook)).await {
        return match err {
            StorageError::UploadInProgress(_) => {
                api.respond(Payload::Text(err.to_string()), StatusCode::CONFLICT, Vec::new())
            }
            err => api.internal_error(err),
        };
    }

    let sha256_digest = {
        let sha = hasher.lock().unwrap().clone();
        format!("sha256:{}", to_hex(&sha.finalize()))
    };
    let mut checksums = vec![sha256_digest];

    let tar_products = {
        let mut info = tar_info.lock().unwrap();
        if info.error.is_none() {
            Some((info.files.json(), info.tarsum.compute(&json_content)))
        } else {
            None
        }
    };
    if let Some((files_json, tarsum)) = tar_products {
        let files_json = match files_json {
            Ok(files_json) => files_json,
            Err(err) => return api.internal_error(err),
        };
        if let Err(err) =
            layers::set_image_files_cache(api.storage.as_ref(), image_id, &files_json).await
        {
            log::warn!("failed to cache file inventory for {image_id}: {err}");
        }
        checksums.push(tarsum);
    }

    // A checksum deposited before the layer is verified right here; otherwise
    // the accepted set is stored and offered to the client via cookie for the
    // confirmation request.
    let checksum_path = paths::image_checksum_path(image_id);
    if api.storage.exists(&checksum_path).await.unwrap_or(false) {
        let stored = load_checksums(api, image_id).await;
        if stored.iter().any(|stored| checksums.contains(stored)) {
            if let Err(err) = api.storage.remove(&mark_path).await {
                return api.respond(
                    Payload::Text(format!("Error removing Mark Path: {err}")),
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Vec::new(),
                );
            }
            return api.respond(Payload::Bool(true), StatusCode::OK, Vec::new());
        }
        log::debug!("wrong checksum for {image_id}: {stored:?} not in {checksums:?}");
        return api.respond(
            Payload::Text("Checksum mismatch, ignoring the layer".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    }

    if let Err(err) = layers::store_checksum(api.storage.as_ref(), image_id, &checksums).await {
        return api.respond(
            Payload::Text(format!("Error storing Checksum: {err}")),
            StatusCode::INTERNAL_SERVER_ERROR,
            Vec::new(),
        );
    }
    let cookie = format!("{CHECKSUM_COOKIE}={}", checksums.join(COOKIE_SEPARATOR));
    api.respond(
        Payload::Bool(true),
        StatusCode::OK,
        vec![("Set-Cookie".to_string(), cookie)],
    )
}

pub async fn get_image_json(api: &RegistryApi, image_id: &str, headers: &HeaderMap) -> Response {
    let data = match api.storage.get(&paths::image_json_path(image_id)).await {
        Ok(data) => data,
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Image not found: {err}")),
                StatusCode::NOT_FOUND,
                Vec::new(),
            )
        }
    };
    let size = match api.storage.size(&paths::image_layer_path(image_id)).await {
        Ok(size) => size,
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Unable to Compute Layer Size: {err}")),
                StatusCode::INTERNAL_SERVER_ERROR,
                Vec::new(),
            )
        }
    };

    let mut extra = default_cache_headers();
    extra.push(("X-Docker-Size".to_string(), size.to_string()));

    let checksums = match api.storage.get(&paths::image_checksum_path(image_id)).await {
        Ok(raw) => serde_json::from_slice::<Vec<String>>(&raw).unwrap_or_default(),
        Err(err) if err.is_not_found() => {
            return api.respond(
                Payload::Text(format!("Checksum not found: {err}")),
                StatusCode::NOT_FOUND,
                Vec::new(),
            )
        }
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Error Reading Checksum: {err}")),
                StatusCode::INTERNAL_SERVER_ERROR,
                Vec::new(),
            )
        }
    };
    let checksum_header = if user_agent::is_old_protocol(user_agent::from_headers(headers)) {
        "X-Docker-Checksum"
    } else {
        "X-Docker-Checksum-Payload"
    };
    for checksum in checksums {
        extra.push((checksum_header.to_string(), checksum));
    }

    api.respond(Payload::Raw(data), StatusCode::OK, extra)
}

pub async fn put_image_json(api: &RegistryApi, image_id: &str, body: Body) -> Response {
    let body_bytes = match super::read_body(body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Error Reading Body: {err}")),
                StatusCode::BAD_REQUEST,
                Vec::new(),
            )
        }
    };
    let data: serde_json::Value = match serde_json::from_slice(&body_bytes) {
        Ok(data) => data,
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Invalid JSON: {err}")),
                StatusCode::BAD_REQUEST,
                Vec::new(),
            )
        }
    };
    let Some(object) = data.as_object() else {
        return api.respond(
            Payload::Text("Invalid JSON: not an object".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    };

    let Some(id_value) = object.get("id") else {
        return api.respond(
            Payload::Text("Missing key 'id' in JSON".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    };
    let Some(data_id) = id_value.as_str() else {
        return api.respond(
            Payload::Text("Invalid JSON: 'id' is not a string".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    };
    if data_id != image_id {
        return api.respond(
            Payload::Text("JSON image id != image id specified in path".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    }

    let mut parent_id: Option<&str> = None;
    if let Some(parent_value) = object.get("parent") {
        let Some(parent) = parent_value.as_str() else {
            return api.respond(
                Payload::Text("Invalid JSON: 'parent' is not a string".to_string()),
                StatusCode::BAD_REQUEST,
                Vec::new(),
            );
        };
        let parent_exists = api
            .storage
            .exists(&paths::image_json_path(parent))
            .await
            .unwrap_or(false);
        if !parent_exists {
            return api.respond(
                Payload::Text("Image depends on non-existant parent".to_string()),
                StatusCode::BAD_REQUEST,
                Vec::new(),
            );
        }
        parent_id = Some(parent);
    }

    let json_path = paths::image_json_path(image_id);
    let mark_path = paths::image_mark_path(image_id);
    let json_exists = api.storage.exists(&json_path).await.unwrap_or(false);
    if json_exists {
        let mark_exists = api.storage.exists(&mark_path).await.unwrap_or(false);
        if !mark_exists {
            return api.respond(
                Payload::Text("Image already exists".to_string()),
                StatusCode::CONFLICT,
                Vec::new(),
            );
        }
    }

    if let Err(err) = api.storage.put(&mark_path, b"true").await {
        return api.respond(
            Payload::Text(format!("Put Mark Error: {err}")),
            StatusCode::INTERNAL_SERVER_ERROR,
            Vec::new(),
        );
    }
    // clear any checksum left behind by a failed earlier attempt
    let _ = api
        .storage
        .remove(&paths::image_checksum_path(image_id))
        .await;
    if let Err(err) = api.storage.put(&json_path, &body_bytes).await {
        return api.respond(
            Payload::Text(format!("Put Json Error: {err}")),
            StatusCode::INTERNAL_SERVER_ERROR,
            Vec::new(),
        );
    }
    if let Err(err) = layers::generate_ancestry(api.storage.as_ref(), image_id, parent_id).await {
        return api.respond(
            Payload::Text(format!("Generate Ancestry Error: {err}")),
            StatusCode::INTERNAL_SERVER_ERROR,
            Vec::new(),
        );
    }
    api.respond(Payload::Text("true".to_string()), StatusCode::OK, Vec::new())
}

pub async fn get_image_ancestry(api: &RegistryApi, image_id: &str) -> Response {
    match api
        .storage
        .get(&paths::image_ancestry_path(image_id))
        .await
    {
        Ok(data) => api.respond(Payload::Raw(data), StatusCode::OK, default_cache_headers()),
        Err(err) => api.respond(
            Payload::Text(format!("Image not found: {err}")),
            StatusCode::NOT_FOUND,
            Vec::new(),
        ),
    }
}

pub async fn put_image_checksum(api: &RegistryApi, image_id: &str, headers: &HeaderMap) -> Response {
    let checksum = checksum_from_headers(headers);
    if checksum.is_empty() {
        return api.respond(
            Payload::Text("Missing Image's checksum".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    }

    let json_exists = api
        .storage
        .exists(&paths::image_json_path(image_id))
        .await
        .unwrap_or(false);
    if !json_exists {
        return api.respond(
            Payload::Text("Image not found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        );
    }
    let mark_path = paths::image_mark_path(image_id);
    if !api.storage.exists(&mark_path).await.unwrap_or(false) {
        return api.respond(
            Payload::Text(
                "Cannot set this image checksum (mark path does not exist)".to_string(),
            ),
            StatusCode::CONFLICT,
            Vec::new(),
        );
    }

    // the accepted set travels back either in the client's cookie or in the
    // checksum blob written at layer time
    let mut accepted = cookie_checksums(headers);
    if accepted.is_empty() {
        accepted = load_checksums(api, image_id).await;
    }
    if !accepted.contains(&checksum) {
        log::debug!("wrong checksum for {image_id}: {checksum} not in {accepted:?}");
        return api.respond(
            Payload::Text("Checksum mismatch, ignoring the layer".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    }

    if let Err(err) =
        layers::store_checksum(api.storage.as_ref(), image_id, std::slice::from_ref(&checksum))
            .await
    {
        return api.respond(
            Payload::Text(format!("Error storing Checksum: {err}")),
            StatusCode::INTERNAL_SERVER_ERROR,
            Vec::new(),
        );
    }
    if let Err(err) = api.storage.remove(&mark_path).await {
        return api.respond(
            Payload::Text(format!("Error removing Mark Path: {err}")),
            StatusCode::INTERNAL_SERVER_ERROR,
            Vec::new(),
        );
    }
    api.respond(Payload::Bool(true), StatusCode::OK, Vec::new())
}

pub async fn get_image_files(api: &RegistryApi, image_id: &str) -> Response {
    match layers::get_image_files_json(api.storage.as_ref(), image_id).await {
        Ok(data) => api.respond(Payload::Raw(data), StatusCode::OK, default_cache_headers()),
        Err(LayerError::Tar(_)) => api.respond(
            Payload::Text("Layer format not supported".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        ),
        Err(err) => api.respond(
            Payload::Text(format!("Image not found: {err}")),
            StatusCode::NOT_FOUND,
            Vec::new(),
        ),
    }
}

pub async fn get_image_diff(api: &RegistryApi, image_id: &str) -> Response {
    match layers::get_image_diff_cache(api.storage.as_ref(), image_id).await {
        Ok(Some(diff_json)) => {
            api.respond(Payload::Raw(diff_json), StatusCode::OK, default_cache_headers())
        }
        Ok(None) => {
            // cache miss: kick off generation, a later request picks it up
            tokio::spawn(layers::gen_diff(api.storage.clone(), image_id.to_string()));
            api.respond(Payload::Raw(Vec::new()), StatusCode::OK, default_cache_headers())
        }
        Err(err) => api.internal_error(err),
    }
}

/// Stored checksum set for an image; empty on any error.
async fn load_checksums(api: &RegistryApi, image_id: &str) -> Vec<String> {
    match api.storage.get(&paths::image_checksum_path(image_id)).await {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// The submitted checksum: the payload header, or the plain header older
/// daemons send.
fn checksum_from_headers(headers: &HeaderMap) -> String {
    for name in ["X-Docker-Checksum-Payload", "X-Docker-Checksum"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    String::new()
}

/// Checksums echoed back in the `checksum` cookie. Both historical
/// separators are accepted.
fn cookie_checksums(headers: &HeaderMap) -> Vec<String> {
    let mut checksums = Vec::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            let pair = pair.trim();
            if let Some(rest) = pair.strip_prefix("checksum=") {
                for checksum in rest.split(['|', ',']) {
                    if !checksum.is_empty() {
                        checksums.push(checksum.to_string());
                    }
                }
            }
        }
    }
    checksums
}
