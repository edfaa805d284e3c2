//! Tag and repository-metadata handlers.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use chrono::Utc;
use serde_json::Value;

use super::{user_agent, Payload, RegistryApi};
use crate::storage::paths::{self, TAG_PREFIX};

pub async fn get_repo_tags(api: &RegistryApi, namespace: &str, repo: &str) -> Response {
    log::debug!("listing tags for {namespace}/{repo}");
    let names = match api
        .storage
        .list(&paths::repo_tag_path(namespace, repo, ""))
        .await
    {
        Ok(names) => names,
        Err(_) => {
            return api.respond(
                Payload::Text("Repository not found".to_string()),
                StatusCode::NOT_FOUND,
                Vec::new(),
            )
        }
    };
    let mut data = BTreeMap::new();
    for name in names {
        let base = name.rsplit('/').next().unwrap_or(&name);
        let Some(tag_name) = base.strip_prefix(TAG_PREFIX) else {
            continue;
        };
        let content = match api.storage.get(&name).await {
            Ok(content) => content,
            Err(err) => return api.internal_error(err),
        };
        data.insert(
            tag_name.to_string(),
            String::from_utf8_lossy(&content).into_owned(),
        );
    }
    api.respond(
        Payload::Json(serde_json::to_value(data).unwrap_or_default()),
        StatusCode::OK,
        Vec::new(),
    )
}

pub async fn delete_repo_tags(api: &RegistryApi, namespace: &str, repo: &str) -> Response {
    log::debug!("deleting all tags for {namespace}/{repo}");
    let names = match api
        .storage
        .list(&paths::repo_tag_path(namespace, repo, ""))
        .await
    {
        Ok(names) => names,
        Err(_) => {
            return api.respond(
                Payload::Text("Repository not found".to_string()),
                StatusCode::NOT_FOUND,
                Vec::new(),
            )
        }
    };
    for name in names {
        let base = name.rsplit('/').next().unwrap_or(&name);
        if !base.starts_with(TAG_PREFIX) {
            continue;
        }
        if let Err(err) = api.storage.remove(&name).await {
            return api.internal_error(err);
        }
    }
    api.respond(Payload::Bool(true), StatusCode::OK, Vec::new())
}

pub async fn get_repo_tag(api: &RegistryApi, namespace: &str, repo: &str, tag: &str) -> Response {
    log::debug!("fetching tag {namespace}/{repo}:{tag}");
    match api
        .storage
        .get(&paths::repo_tag_path(namespace, repo, tag))
        .await
    {
        Ok(content) => api.respond(Payload::Raw(content), StatusCode::OK, Vec::new()),
        Err(_) => api.respond(
            Payload::Text("Tag not found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        ),
    }
}

pub async fn put_repo_tag(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    tag: &str,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    log::debug!("writing tag {namespace}/{repo}:{tag}");
    let data = match super::read_body(body).await {
        Ok(data) => data,
        Err(_) => {
            return api.respond(
                Payload::Text("Invalid data".to_string()),
                StatusCode::BAD_REQUEST,
                Vec::new(),
            )
        }
    };
    if data.is_empty() {
        return api.respond(
            Payload::Text("Invalid data".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        );
    }
    let image_id = String::from_utf8_lossy(&data)
        .trim()
        .trim_matches('"')
        .to_string();
    let image_exists = api
        .storage
        .exists(&paths::image_json_path(&image_id))
        .await
        .unwrap_or(false);
    if !image_exists {
        return api.respond(
            Payload::Text("Image not found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        );
    }
    if let Err(err) = api
        .storage
        .put(
            &paths::repo_tag_path(namespace, repo, tag),
            image_id.as_bytes(),
        )
        .await
    {
        return api.internal_error(err);
    }

    // refresh repository metadata on every tag write, plus a per-tag copy
    let metadata = create_repo_json(user_agent::from_headers(headers));
    match serde_json::to_vec(&metadata) {
        Ok(json_data) => {
            if let Err(err) = api
                .storage
                .put(&paths::repo_json_path(namespace, repo), &json_data)
                .await
            {
                log::warn!("failed to write repository metadata for {namespace}/{repo}: {err}");
            }
            if let Err(err) = api
                .storage
                .put(&paths::repo_tag_json_path(namespace, repo, tag), &json_data)
                .await
            {
                log::warn!("failed to write tag metadata for {namespace}/{repo}:{tag}: {err}");
            }
        }
        Err(err) => return api.internal_error(err),
    }
    api.respond(Payload::Bool(true), StatusCode::OK, Vec::new())
}

pub async fn delete_repo_tag(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    tag: &str,
) -> Response {
    log::debug!("deleting tag {namespace}/{repo}:{tag}");
    match api
        .storage
        .remove(&paths::repo_tag_path(namespace, repo, tag))
        .await
    {
        Ok(()) => api.respond(Payload::Bool(true), StatusCode::OK, Vec::new()),
        Err(_) => api.respond(
            Payload::Text("Tag not found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        ),
    }
}

pub async fn get_repo_json(api: &RegistryApi, namespace: &str, repo: &str) -> Response {
    log::debug!("fetching repository metadata for {namespace}/{repo}");
    // Docker expects a well-formed metadata object even when none was ever
    // written, so every failure degrades to the default shape.
    let content = match api
        .storage
        .get(&paths::repo_json_path(namespace, repo))
        .await
    {
        Ok(content) => content,
        Err(_) => return api.respond(empty_repo_json(), StatusCode::OK, Vec::new()),
    };
    match serde_json::from_slice::<Value>(&content) {
        Ok(data) => api.respond(Payload::Json(data), StatusCode::OK, Vec::new()),
        Err(_) => api.respond(empty_repo_json(), StatusCode::OK, Vec::new()),
    }
}

pub async fn get_repo_tag_json(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    tag: &str,
) -> Response {
    match api
        .storage
        .get(&paths::repo_tag_json_path(namespace, repo, tag))
        .await
    {
        Ok(content) => api.respond(Payload::Raw(content), StatusCode::OK, Vec::new()),
        Err(_) => api.respond(
            Payload::Text("Tag not found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        ),
    }
}

pub async fn delete_repo(api: &RegistryApi, namespace: &str, repo: &str) -> Response {
    log::debug!("deleting repository {namespace}/{repo}");
    match api
        .storage
        .remove_all(&paths::repo_path(namespace, repo))
        .await
    {
        Ok(()) => api.respond(Payload::Bool(true), StatusCode::OK, Vec::new()),
        Err(_) => api.respond(
            Payload::Text("Repository not found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        ),
    }
}

fn empty_repo_json() -> Payload {
    Payload::Json(serde_json::json!({
        "last_update": null,
        "docker_version": null,
        "docker_go_version": null,
        "arch": "amd64",
        "os": "linux",
        "kernel": null,
    }))
}

/// Repository metadata from the pushing client's User-Agent.
pub fn create_repo_json(user_agent: &str) -> Value {
    let pairs = user_agent::parse_pairs(user_agent);
    let mut props = serde_json::Map::new();
    props.insert(
        "last_update".to_string(),
        Value::from(Utc::now().timestamp()),
    );
    if let Some(version) = pairs.get("docker") {
        props.insert("docker_version".to_string(), Value::from(version.clone()));
    }
    if let Some(version) = pairs.get("go") {
        props.insert(
            "docker_go_version".to_string(),
            Value::from(version.clone()),
        );
    }
    let arch = pairs
        .get("arch")
        .map(|v| v.to_lowercase())
        .unwrap_or_else(|| "amd64".to_string());
    props.insert("arch".to_string(), Value::from(arch));
    let os = pairs
        .get("os")
        .map(|v| v.to_lowercase())
        .unwrap_or_else(|| "linux".to_string());
    props.insert("os".to_string(), Value::from(os));
    if let Some(kernel) = pairs.get("kernel") {
        props.insert("kernel".to_string(), Value::from(kernel.to_lowercase()));
    }
    Value::Object(props)
}
