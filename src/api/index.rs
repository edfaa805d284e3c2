//! Docker Index endpoints. The repository-images merge is real; the user and
//! search endpoints are stubs because the registry runs standalone with no
//! authentication.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use serde_json::Value;

use super::{Headers, Payload, RegistryApi};
use crate::layers;
use crate::storage::paths;

fn index_headers(host: &str, namespace: &str, repo: &str, access: &str) -> Headers {
    let fake_token =
        format!("Token signature=FAKESIGNATURE123,repository=\"{namespace}/{repo}\",access={access}");
    vec![
        ("X-Docker-Endpoints".to_string(), host.to_string()),
        ("WWW-Authenticate".to_string(), fake_token.clone()),
        ("X-Docker-Token".to_string(), fake_token),
    ]
}

async fn merge_repo_images(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    host: &str,
    body: Body,
    success_status: StatusCode,
) -> Response {
    let body_bytes = match super::read_body(body).await {
        Ok(bytes) => bytes,
        Err(err) => return api.internal_error(err),
    };
    log::debug!("index images body for {namespace}/{repo}: {} bytes", body_bytes.len());
    let images: Vec<Value> = match serde_json::from_slice(&body_bytes) {
        Ok(images) => images,
        Err(err) => {
            return api.respond(
                Payload::Text(format!("Error Decoding JSON: {err}")),
                StatusCode::BAD_REQUEST,
                Vec::new(),
            )
        }
    };
    if let Err(err) =
        layers::update_index_images(api.storage.as_ref(), namespace, repo, &body_bytes, &images)
            .await
    {
        return api.internal_error(err);
    }
    api.respond(
        Payload::Empty,
        success_status,
        index_headers(host, namespace, repo, "write"),
    )
}

pub async fn put_repo(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    host: &str,
    body: Body,
) -> Response {
    merge_repo_images(api, namespace, repo, host, body, StatusCode::OK).await
}

pub async fn put_repo_images(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    host: &str,
    body: Body,
) -> Response {
    merge_repo_images(api, namespace, repo, host, body, StatusCode::NO_CONTENT).await
}

pub async fn get_repo_images(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    host: &str,
) -> Response {
    match api
        .storage
        .get(&paths::repo_index_images_path(namespace, repo))
        .await
    {
        Ok(data) => api.respond(
            Payload::Raw(data),
            StatusCode::OK,
            index_headers(host, namespace, repo, "read"),
        ),
        Err(_) => api.respond(
            Payload::Text("Image Not Found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        ),
    }
}

pub async fn delete_repo_images(
    api: &RegistryApi,
    namespace: &str,
    repo: &str,
    host: &str,
) -> Response {
    let _ = api
        .storage
        .remove(&paths::repo_index_images_path(namespace, repo))
        .await;
    api.respond(
        Payload::Empty,
        StatusCode::NO_CONTENT,
        index_headers(host, namespace, repo, "delete"),
    )
}

pub async fn put_repo_auth(api: &RegistryApi) -> Response {
    api.respond(Payload::Text("OK".to_string()), StatusCode::OK, Vec::new())
}

pub async fn login(api: &RegistryApi) -> Response {
    api.respond(Payload::Text("OK".to_string()), StatusCode::OK, Vec::new())
}

pub async fn create_user(api: &RegistryApi) -> Response {
    api.respond(
        Payload::Text("User created".to_string()),
        StatusCode::CREATED,
        Vec::new(),
    )
}

pub async fn update_user(api: &RegistryApi) -> Response {
    api.respond(Payload::Empty, StatusCode::NO_CONTENT, Vec::new())
}

pub async fn search(api: &RegistryApi) -> Response {
    api.respond(
        Payload::Json(serde_json::json!({})),
        StatusCode::OK,
        Vec::new(),
    )
}
