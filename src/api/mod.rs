pub mod caching;
pub mod images;
pub mod index;
pub mod tags;
pub mod user_agent;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::config::ApiConfig;
use crate::storage::{BlobReader, Storage};

const MAX_JSON_BODY_BYTES: usize = 16 * 1024 * 1024;

pub type Headers = Vec<(String, String)>;

#[derive(Clone)]
pub struct RegistryApi {
    pub config: Arc<ApiConfig>,
    pub storage: Arc<dyn Storage>,
}

impl RegistryApi {
    pub fn new(config: ApiConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config: Arc::new(config),
            storage,
        }
    }
}

/// Response body polymorphism of the v1 protocol: strings at error status are
/// wrapped as `{"error": …}`, raw bytes and streams pass through untouched.
pub enum Payload {
    Empty,
    Bool(bool),
    Int(i64),
    Text(String),
    Raw(Vec<u8>),
    Stream(BlobReader),
    Json(serde_json::Value),
}

impl RegistryApi {
    /// Uniform response encoding: default headers from configuration first,
    /// per-response headers second, then the payload.
    pub fn respond(&self, payload: Payload, status: StatusCode, headers: Headers) -> Response {
        let mut map = HeaderMap::new();
        for (name, values) in &self.config.default_headers {
            for value in values {
                append_header(&mut map, name, value);
            }
        }
        for (name, value) in &headers {
            append_header(&mut map, name, value);
        }

        let body = match payload {
            Payload::Empty => Body::empty(),
            Payload::Bool(value) => Body::from(format!("{value}")),
            Payload::Int(value) => Body::from(format!("{value}")),
            Payload::Text(text) => {
                if status.as_u16() >= 400 {
                    append_header(&mut map, "Content-Type", "application/json");
                    Body::from(serde_json::json!({ "error": text }).to_string())
                } else {
                    Body::from(text)
                }
            }
            Payload::Raw(bytes) => Body::from(bytes),
            Payload::Stream(reader) => Body::from_stream(ReaderStream::new(reader)),
            Payload::Json(value) => match serde_json::to_vec(&value) {
                Ok(encoded) => {
                    append_header(&mut map, "Content-Type", "application/json");
                    Body::from(encoded)
                }
                Err(err) => {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Internal Error: {err}"),
                    )
                        .into_response()
                }
            },
        };
        (status, map, body).into_response()
    }

    pub fn internal_error(&self, text: impl std::fmt::Display) -> Response {
        self.respond(
            Payload::Text(format!("Internal Error: {text}")),
            StatusCode::INTERNAL_SERVER_ERROR,
            Vec::new(),
        )
    }

    fn not_found(&self) -> Response {
        self.respond(
            Payload::Text("Not Found".to_string()),
            StatusCode::NOT_FOUND,
            Vec::new(),
        )
    }
}

fn append_header(map: &mut HeaderMap, name: &str, value: &str) {
    let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
        log::warn!("skipping invalid header name {name}");
        return;
    };
    let Ok(value) = HeaderValue::from_str(value) else {
        log::warn!("skipping invalid value for header {name}");
        return;
    };
    map.append(name, value);
}

pub fn build_router(api: RegistryApi) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/_ping", get(ping))
        .route("/_status", get(status))
        .route("/v1/{*path}", any(v1_dispatch))
        .with_state(api)
}

pub async fn serve(api: RegistryApi) -> anyhow::Result<()> {
    let mut addr = api.config.addr.clone();
    if addr.starts_with(':') {
        addr = format!("0.0.0.0{addr}");
    }
    let router = build_router(api);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                log::warn!("failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutting down");
}

async fn home() -> &'static str {
    "docker-registry server\n"
}

async fn ping(State(api): State<RegistryApi>) -> Response {
    api.respond(
        Payload::Bool(true),
        StatusCode::OK,
        vec![(
            "X-Docker-Registry-Standalone".to_string(),
            "true".to_string(),
        )],
    )
}

async fn status(State(api): State<RegistryApi>) -> Response {
    api.respond(
        Payload::Json(serde_json::json!({})),
        StatusCode::OK,
        Vec::new(),
    )
}

/// Routes under `/v1/`, parsed by hand: the optional namespace segment in
/// repository paths gives them ambiguous shapes a route tree cannot hold.
#[derive(Debug, Clone, PartialEq, Eq)]
enum V1Route {
    Ping,
    Status,
    ImageLayer { id: String },
    ImageJson { id: String },
    ImageAncestry { id: String },
    ImageChecksum { id: String },
    ImageFiles { id: String },
    ImageDiff { id: String },
    RepoTags { namespace: String, repo: String },
    RepoTag { namespace: String, repo: String, tag: String },
    RepoTagJson { namespace: String, repo: String, tag: String },
    RepoJson { namespace: String, repo: String },
    RepoImages { namespace: String, repo: String },
    RepoAuth { namespace: String, repo: String },
    Repo { namespace: String, repo: String },
    Users,
    User,
    Search,
}

fn parse_v1_path(path: &str) -> Option<V1Route> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["_ping"] => Some(V1Route::Ping),
        ["_status"] => Some(V1Route::Status),
        ["users"] => Some(V1Route::Users),
        ["users", _] => Some(V1Route::User),
        ["search"] => Some(V1Route::Search),
        ["images", id, blob] => {
            let id = id.to_string();
            match *blob {
                "layer" => Some(V1Route::ImageLayer { id }),
                "json" => Some(V1Route::ImageJson { id }),
                "ancestry" => Some(V1Route::ImageAncestry { id }),
                "checksum" => Some(V1Route::ImageChecksum { id }),
                "files" => Some(V1Route::ImageFiles { id }),
                "diff" => Some(V1Route::ImageDiff { id }),
                _ => None,
            }
        }
        ["repositories", rest @ ..] => parse_repo_path(rest),
        _ => None,
    }
}

fn parse_repo_path(segments: &[&str]) -> Option<V1Route> {
    use crate::storage::paths::DEFAULT_NAMESPACE;
    match segments {
        [] => None,
        [repo] => repo_route(DEFAULT_NAMESPACE, repo, &[]),
        [repo, rest @ ..] => {
            // try the namespace-less form first, as the original router does
            repo_route(DEFAULT_NAMESPACE, repo, rest).or_else(|| match rest {
                [namespaced_repo, tail @ ..] => repo_route(repo, namespaced_repo, tail),
                [] => None,
            })
        }
    }
}

fn repo_route(namespace: &str, repo: &str, tail: &[&str]) -> Option<V1Route> {
    let namespace = namespace.to_string();
    let repo = repo.to_string();
    match tail {
        [] => Some(V1Route::Repo { namespace, repo }),
        ["tags"] => Some(V1Route::RepoTags { namespace, repo }),
        ["tags", tag] => Some(V1Route::RepoTag {
            namespace,
            repo,
            tag: tag.to_string(),
        }),
        ["tags", tag, "json"] => Some(V1Route::RepoTagJson {
            namespace,
            repo,
            tag: tag.to_string(),
        }),
        ["json"] => Some(V1Route::RepoJson { namespace, repo }),
        ["images"] => Some(V1Route::RepoImages { namespace, repo }),
        ["auth"] => Some(V1Route::RepoAuth { namespace, repo }),
        _ => None,
    }
}

async fn v1_dispatch(
    State(api): State<RegistryApi>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(route) = parse_v1_path(&path) else {
        return api.not_found();
    };
    log::debug!("{method} /v1/{path}");

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match (route, method) {
        (V1Route::Ping, Method::GET) => ping(State(api)).await,
        (V1Route::Status, Method::GET) => status(State(api)).await,

        (V1Route::ImageLayer { id }, Method::GET) => {
            gated(&api, &id, &headers, images::get_image_layer(&api, &id)).await
        }
        (V1Route::ImageLayer { id }, Method::PUT) => images::put_image_layer(&api, &id, body).await,
        (V1Route::ImageJson { id }, Method::GET) => {
            gated(
                &api,
                &id,
                &headers,
                images::get_image_json(&api, &id, &headers),
            )
            .await
        }
        (V1Route::ImageJson { id }, Method::PUT) => images::put_image_json(&api, &id, body).await,
        (V1Route::ImageAncestry { id }, Method::GET) => {
            gated(&api, &id, &headers, images::get_image_ancestry(&api, &id)).await
        }
        (V1Route::ImageChecksum { id }, Method::PUT) => {
            images::put_image_checksum(&api, &id, &headers).await
        }
        (V1Route::ImageFiles { id }, Method::GET) => {
            gated(&api, &id, &headers, images::get_image_files(&api, &id)).await
        }
        (V1Route::ImageDiff { id }, Method::GET) => {
            gated(&api, &id, &headers, images::get_image_diff(&api, &id)).await
        }

        (V1Route::RepoTags { namespace, repo }, Method::GET) => {
            tags::get_repo_tags(&api, &namespace, &repo).await
        }
        (V1Route::RepoTags { namespace, repo }, Method::DELETE) => {
            tags::delete_repo_tags(&api, &namespace, &repo).await
        }
        (
            V1Route::RepoTag {
                namespace,
                repo,
                tag,
            },
            Method::GET,
        ) => tags::get_repo_tag(&api, &namespace, &repo, &tag).await,
        (
            V1Route::RepoTag {
                namespace,
                repo,
                tag,
            },
            Method::PUT,
        ) => tags::put_repo_tag(&api, &namespace, &repo, &tag, &headers, body).await,
        (
            V1Route::RepoTag {
                namespace,
                repo,
                tag,
            },
            Method::DELETE,
        ) => tags::delete_repo_tag(&api, &namespace, &repo, &tag).await,
        (
            V1Route::RepoTagJson {
                namespace,
                repo,
                tag,
            },
            Method::GET,
        ) => tags::get_repo_tag_json(&api, &namespace, &repo, &tag).await,
        (V1Route::RepoJson { namespace, repo }, Method::GET) => {
            tags::get_repo_json(&api, &namespace, &repo).await
        }

        (V1Route::Repo { namespace, repo }, Method::PUT) => {
            index::put_repo(&api, &namespace, &repo, &host, body).await
        }
        (V1Route::Repo { namespace, repo }, Method::DELETE) => {
            tags::delete_repo(&api, &namespace, &repo).await
        }
        (V1Route::RepoImages { namespace, repo }, Method::GET) => {
            index::get_repo_images(&api, &namespace, &repo, &host).await
        }
        (V1Route::RepoImages { namespace, repo }, Method::PUT) => {
            index::put_repo_images(&api, &namespace, &repo, &host, body).await
        }
        (V1Route::RepoImages { namespace, repo }, Method::DELETE) => {
            index::delete_repo_images(&api, &namespace, &repo, &host).await
        }
        (V1Route::RepoAuth { .. }, Method::PUT) => index::put_repo_auth(&api).await,

        (V1Route::Users, Method::GET) => index::login(&api).await,
        (V1Route::Users, Method::POST) => index::create_user(&api).await,
        (V1Route::User, Method::PUT) => index::update_user(&api).await,
        (V1Route::Search, Method::GET) => index::search(&api).await,

        _ => api.not_found(),
    }
}

/// Wrap an image GET with the completion and conditional-request gates.
async fn gated(
    api: &RegistryApi,
    image_id: &str,
    headers: &HeaderMap,
    handler: impl std::future::Future<Output = Response>,
) -> Response {
    if let Some(response) = caching::require_completion(api, image_id).await {
        return response;
    }
    if let Some(response) = caching::check_if_modified_since(api, headers) {
        return response;
    }
    handler.await
}

pub(crate) async fn read_body(body: Body) -> Result<axum::body::Bytes, axum::Error> {
    axum::body::to_bytes(body, MAX_JSON_BODY_BYTES).await
}
