//! End-to-end push/pull/tag scenarios driven through the router.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use docker_registry::api::{build_router, RegistryApi};
use docker_registry::config::{ApiConfig, LocalConfig};
use docker_registry::digest::sha256_hex;
use docker_registry::storage::LocalStorage;
use http_body_util::BodyExt;
use tower::ServiceExt;

async fn setup() -> (tempfile::TempDir, RegistryApi) {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(LocalConfig {
        root: dir.path().to_path_buf(),
    })
    .await
    .unwrap();
    (dir, RegistryApi::new(ApiConfig::default(), Arc::new(storage)))
}

async fn request(
    api: &RegistryApi,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: impl Into<Vec<u8>>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let router = build_router(api.clone());
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = router
        .oneshot(builder.body(Body::from(body.into())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec();
    (status, headers, body)
}

/// Gzipped single-file tar, the shape docker pushes as a layer.
fn gzipped_layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_400_000_000);
        header.set_cksum();
        builder.append(&header, *content).unwrap();
    }
    let raw = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&raw).unwrap();
    encoder.finish().unwrap()
}

fn expected_layer_checksum(json: &[u8], layer: &[u8]) -> String {
    let mut combined = json.to_vec();
    combined.extend_from_slice(layer);
    format!("sha256:{}", sha256_hex(&combined))
}

/// Drive a full JSON → layer → checksum push for a rootless image.
async fn push_image(api: &RegistryApi, id: &str, layer: &[u8]) -> String {
    let json = format!(r#"{{"id":"{id}"}}"#);
    let (status, _, body) = request(
        api,
        Method::PUT,
        &format!("/v1/images/{id}/json"),
        &[],
        json.as_bytes().to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

    let (status, _, body) = request(
        api,
        Method::PUT,
        &format!("/v1/images/{id}/layer"),
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

    let checksum = expected_layer_checksum(json.as_bytes(), layer);
    let (status, _, body) = request(
        api,
        Method::PUT,
        &format!("/v1/images/{id}/checksum"),
        &[("X-Docker-Checksum-Payload", checksum.as_str())],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    checksum
}

#[tokio::test]
async fn ping_reports_standalone() {
    let (_dir, api) = setup().await;
    for uri in ["/_ping", "/v1/_ping"] {
        let (status, headers, body) = request(&api, Method::GET, uri, &[], Vec::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"true");
        assert_eq!(headers["X-Docker-Registry-Standalone"], "true");
    }
}

#[tokio::test]
async fn default_headers_from_config_are_attached() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(LocalConfig {
        root: dir.path().to_path_buf(),
    })
    .await
    .unwrap();
    let mut config = ApiConfig::default();
    config.default_headers.insert(
        "X-Docker-Registry-Version".to_string(),
        vec!["0.6.5".to_string()],
    );
    let api = RegistryApi::new(config, Arc::new(storage));
    let (_, headers, _) = request(&api, Method::GET, "/v1/_ping", &[], Vec::new()).await;
    assert_eq!(headers["X-Docker-Registry-Version"], "0.6.5");
}

#[tokio::test]
async fn happy_path_push_of_rootless_image() {
    let (_dir, api) = setup().await;
    let json = br#"{"id":"abc"}"#;

    let (status, _, body) =
        request(&api, Method::PUT, "/v1/images/abc/json", &[], json.to_vec()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"true");
    assert!(api.storage.exists("images/abc/_inprogress").await.unwrap());
    assert!(api.storage.exists("images/abc/json").await.unwrap());
    let ancestry: Vec<String> =
        serde_json::from_slice(&api.storage.get("images/abc/ancestry").await.unwrap()).unwrap();
    assert_eq!(ancestry, vec!["abc"]);

    let layer = gzipped_layer(&[("hello", b"world")]);
    let (status, headers, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/layer",
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(api.storage.exists("images/abc/_files").await.unwrap());

    let expected = expected_layer_checksum(json, &layer);
    let cookie = headers["Set-Cookie"].to_str().unwrap();
    assert!(cookie.starts_with("checksum="));
    assert!(cookie.contains(&expected), "cookie must offer the sha256");
    assert!(
        cookie.contains("|tarsum+sha256:"),
        "cookie must offer the tarsum behind the pipe separator"
    );

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/checksum",
        &[("X-Docker-Checksum-Payload", expected.as_str())],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!api.storage.exists("images/abc/_inprogress").await.unwrap());

    let (status, headers, body) =
        request(&api, Method::GET, "/v1/images/abc/json", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json.to_vec());
    assert_eq!(
        headers["X-Docker-Size"].to_str().unwrap(),
        layer.len().to_string()
    );
    // the checksum header is set on a successful checksum read
    assert_eq!(headers["X-Docker-Checksum-Payload"], expected.as_str());
    assert_eq!(headers["Cache-Control"], "public, max-age=31536000");
    assert_eq!(headers["Last-Modified"], "Thu, 01 Jan 1970 00:00:00 GMT");
}

#[tokio::test]
async fn push_with_bad_checksum_keeps_image_locked() {
    let (_dir, api) = setup().await;
    let json = br#"{"id":"abc"}"#;
    request(&api, Method::PUT, "/v1/images/abc/json", &[], json.to_vec()).await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    request(
        &api,
        Method::PUT,
        "/v1/images/abc/layer",
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer,
    )
    .await;

    let bogus = format!("sha256:{}", "0".repeat(64));
    let (status, _, body) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/checksum",
        &[("X-Docker-Checksum-Payload", bogus.as_str())],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("Checksum mismatch"));
    assert!(api.storage.exists("images/abc/_inprogress").await.unwrap());

    let (status, _, body) =
        request(&api, Method::GET, "/v1/images/abc/json", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("Image is being uploaded"));
}

#[tokio::test]
async fn conditional_request_short_circuits() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    let (status, headers, body) = request(
        &api,
        Method::GET,
        "/v1/images/abc/layer",
        &[("If-Modified-Since", "Wed, 01 Jan 2020 00:00:00 GMT")],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty() || body == b"true");
    assert_eq!(headers["Last-Modified"], "Thu, 01 Jan 1970 00:00:00 GMT");

    let (status, _, body) =
        request(&api, Method::GET, "/v1/images/abc/layer", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, layer);
}

#[tokio::test]
async fn tag_write_refreshes_repo_metadata() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/tags/latest",
        &[("User-Agent", "docker/1.2 go/1.3 kernel/5.0 os/linux arch/amd64")],
        br#""abc""#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/json",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let metadata: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metadata["docker_version"], "1.2");
    assert_eq!(metadata["docker_go_version"], "1.3");
    assert_eq!(metadata["arch"], "amd64");
    assert_eq!(metadata["os"], "linux");
    assert_eq!(metadata["kernel"], "5.0");
    assert!(metadata["last_update"].is_i64());

    // the non-latest tag refreshes metadata too, and leaves a per-tag copy
    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/tags/stable",
        &[("User-Agent", "docker/1.3 go/1.4")],
        br#""abc""#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/tags/stable/json",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tag_metadata: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(tag_metadata["docker_version"], "1.3");

    let (status, _, body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/tags",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tags: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(tags["latest"], "abc");
    assert_eq!(tags["stable"], "abc");
}

#[tokio::test]
async fn tags_resolve_without_namespace() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    request(
        &api,
        Method::PUT,
        "/v1/repositories/x/tags/latest",
        &[],
        br#""abc""#.to_vec(),
    )
    .await;
    // the namespace defaults to library on both write and read
    let (status, _, body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/tags/latest",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"abc");
}

#[tokio::test]
async fn tag_push_validates_body_and_image() {
    let (_dir, api) = setup().await;

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/tags/latest",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/tags/latest",
        &[],
        br#""ghost""#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(String::from_utf8_lossy(&body).contains("Image not found"));
}

#[tokio::test]
async fn parent_resolution_builds_ancestry() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/def/json",
        &[],
        br#"{"id":"def","parent":"abc"}"#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ancestry: Vec<String> =
        serde_json::from_slice(&api.storage.get("images/def/ancestry").await.unwrap()).unwrap();
    assert_eq!(ancestry, vec!["def", "abc"]);

    let (status, _, body) = request(
        &api,
        Method::PUT,
        "/v1/images/ghi/json",
        &[],
        br#"{"id":"ghi","parent":"unknown"}"#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("non-existant parent"));
}

#[tokio::test]
async fn finished_image_rejects_re_push() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    let (status, _, body) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/json",
        &[],
        br#"{"id":"abc"}"#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(String::from_utf8_lossy(&body).contains("Image already exists"));

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/layer",
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn interrupted_push_can_retry_from_json() {
    let (_dir, api) = setup().await;
    let json = br#"{"id":"abc"}"#;
    request(&api, Method::PUT, "/v1/images/abc/json", &[], json.to_vec()).await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    request(
        &api,
        Method::PUT,
        "/v1/images/abc/layer",
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer.clone(),
    )
    .await;

    // marker still present: the client may restart the whole sequence
    let (status, _, _) =
        request(&api, Method::PUT, "/v1/images/abc/json", &[], json.to_vec()).await;
    assert_eq!(status, StatusCode::OK);
    // the stale checksum from the first attempt was cleared
    assert!(!api.storage.exists("images/abc/_checksum").await.unwrap());

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/layer",
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let checksum = expected_layer_checksum(json, &layer);
    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/checksum",
        &[("X-Docker-Checksum-Payload", checksum.as_str())],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn completion_gate_covers_every_image_read() {
    let (_dir, api) = setup().await;
    request(
        &api,
        Method::PUT,
        "/v1/images/abc/json",
        &[],
        br#"{"id":"abc"}"#.to_vec(),
    )
    .await;

    for endpoint in ["json", "layer", "ancestry", "files", "diff"] {
        let (status, _, body) = request(
            &api,
            Method::GET,
            &format!("/v1/images/abc/{endpoint}"),
            &[],
            Vec::new(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "endpoint {endpoint}");
        assert!(
            String::from_utf8_lossy(&body).contains("Image is being uploaded"),
            "endpoint {endpoint}"
        );
    }
}

#[tokio::test]
async fn checksum_before_json_is_not_found() {
    let (_dir, api) = setup().await;
    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/checksum",
        &[("X-Docker-Checksum-Payload", "sha256:aa")],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn checksum_after_completion_conflicts() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    let checksum = push_image(&api, "abc", &layer).await;

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/checksum",
        &[("X-Docker-Checksum-Payload", checksum.as_str())],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn missing_checksum_header_is_rejected() {
    let (_dir, api) = setup().await;
    request(
        &api,
        Method::PUT,
        "/v1/images/abc/json",
        &[],
        br#"{"id":"abc"}"#.to_vec(),
    )
    .await;
    let (status, _, body) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/checksum",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("Missing Image's checksum"));
}

#[tokio::test]
async fn layer_push_requires_json_first() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/images/abc/layer",
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn image_json_validation_errors() {
    let (_dir, api) = setup().await;

    let cases: Vec<(&[u8], &str)> = vec![
        (b"not json", "Invalid JSON"),
        (br#"{"name":"abc"}"#, "Missing key 'id'"),
        (br#"{"id":5}"#, "'id' is not a string"),
        (br#"{"id":"other"}"#, "image id specified in path"),
        (br#"{"id":"abc","parent":7}"#, "'parent' is not a string"),
    ];
    for (body_bytes, expected) in cases {
        let (status, _, body) = request(
            &api,
            Method::PUT,
            "/v1/images/abc/json",
            &[],
            body_bytes.to_vec(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {expected}");
        assert!(
            String::from_utf8_lossy(&body).contains(expected),
            "case {expected}: {}",
            String::from_utf8_lossy(&body)
        );
    }
}

#[tokio::test]
async fn files_endpoint_serves_inventory() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world"), ("./.wh.gone", b"")]);
    push_image(&api, "abc", &layer).await;

    let (status, _, body) =
        request(&api, Method::GET, "/v1/images/abc/files", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    let rows: Vec<Vec<serde_json::Value>> = serde_json::from_slice(&body).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], "hello");
    assert_eq!(rows[1][0], "/gone");
    assert_eq!(rows[1][2], true);
}

#[tokio::test]
async fn diff_endpoint_fills_cache_in_background() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    let (status, _, body) =
        request(&api, Method::GET, "/v1/images/abc/diff", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty(), "first request misses and returns empty");

    let mut diff = None;
    for _ in 0..100 {
        if api.storage.exists("images/abc/_diff").await.unwrap() {
            let (status, _, body) =
                request(&api, Method::GET, "/v1/images/abc/diff", &[], Vec::new()).await;
            assert_eq!(status, StatusCode::OK);
            diff = Some(serde_json::from_slice::<serde_json::Value>(&body).unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let diff = diff.expect("diff cache never materialized");
    assert!(diff["created"].get("hello").is_some());
    assert!(diff["deleted"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn ancestry_endpoint_returns_chain() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    let json = br#"{"id":"def","parent":"abc"}"#;
    request(&api, Method::PUT, "/v1/images/def/json", &[], json.to_vec()).await;
    request(
        &api,
        Method::PUT,
        "/v1/images/def/layer",
        &[("User-Agent", "docker/0.9 go/1.3")],
        layer.clone(),
    )
    .await;
    let checksum = expected_layer_checksum(json, &layer);
    request(
        &api,
        Method::PUT,
        "/v1/images/def/checksum",
        &[("X-Docker-Checksum-Payload", checksum.as_str())],
        Vec::new(),
    )
    .await;

    let (status, _, body) = request(
        &api,
        Method::GET,
        "/v1/images/def/ancestry",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ancestry: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(ancestry, vec!["def", "abc"]);

    let (status, _, _) = request(
        &api,
        Method::GET,
        "/v1/images/ghost/ancestry",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn index_images_merge_and_headers() {
    let (_dir, api) = setup().await;

    let body = br#"[{"id":"abc","checksum":"sha256:11"}]"#;
    let (status, headers, _) = request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/images",
        &[("Host", "registry.example.test")],
        body.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers["X-Docker-Endpoints"], "registry.example.test");
    let token = headers["X-Docker-Token"].to_str().unwrap();
    assert!(token.contains("signature=FAKESIGNATURE123"));
    assert!(token.contains(r#"repository="library/x""#));
    assert!(token.contains("access=write"));
    assert_eq!(headers["WWW-Authenticate"].to_str().unwrap(), token);

    // repeating the same body is a no-op beyond the first
    request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/images",
        &[],
        body.to_vec(),
    )
    .await;
    let (status, headers, images_body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/images",
        &[("Host", "registry.example.test")],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["X-Docker-Token"]
        .to_str()
        .unwrap()
        .contains("access=read"));
    let images: Vec<serde_json::Value> = serde_json::from_slice(&images_body).unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0]["id"], "abc");

    // the repository upsert route merges the same way, with status 200
    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/",
        &[],
        br#"[{"id":"def"}]"#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, images_body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/images",
        &[],
        Vec::new(),
    )
    .await;
    let images: Vec<serde_json::Value> = serde_json::from_slice(&images_body).unwrap();
    assert_eq!(images.len(), 2);

    let (status, _, _) = request(
        &api,
        Method::DELETE,
        "/v1/repositories/library/x/images",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/images",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn repo_json_falls_back_to_default_shape() {
    let (_dir, api) = setup().await;
    let (status, _, body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/ghost/json",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let metadata: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metadata["arch"], "amd64");
    assert_eq!(metadata["os"], "linux");
    assert!(metadata["docker_version"].is_null());
    assert!(metadata["last_update"].is_null());
}

#[tokio::test]
async fn tag_and_repository_deletion() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    for tag in ["latest", "stable"] {
        request(
            &api,
            Method::PUT,
            &format!("/v1/repositories/library/x/tags/{tag}"),
            &[],
            br#""abc""#.to_vec(),
        )
        .await;
    }

    let (status, _, _) = request(
        &api,
        Method::DELETE,
        "/v1/repositories/library/x/tags/latest",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/tags/latest",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = request(
        &api,
        Method::DELETE,
        "/v1/repositories/library/x/tags",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, body) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/tags",
        &[],
        Vec::new(),
    )
    .await;
    let tags: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(tags.as_object().unwrap().is_empty());

    let (status, _, _) = request(
        &api,
        Method::DELETE,
        "/v1/repositories/library/x/",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = request(
        &api,
        Method::GET,
        "/v1/repositories/library/x/tags",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = request(
        &api,
        Method::DELETE,
        "/v1/repositories/library/x/",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stub_endpoints_answer_success() {
    let (_dir, api) = setup().await;

    let (status, _, body) = request(&api, Method::GET, "/v1/users", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, _, _) = request(&api, Method::POST, "/v1/users", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, _) =
        request(&api, Method::PUT, "/v1/users/someone/", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = request(
        &api,
        Method::PUT,
        "/v1/repositories/library/x/auth",
        &[],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = request(&api, Method::GET, "/v1/search", &[], Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"{}");
}

#[tokio::test]
async fn old_protocol_renames_checksum_header() {
    let (_dir, api) = setup().await;
    let layer = gzipped_layer(&[("hello", b"world")]);
    push_image(&api, "abc", &layer).await;

    let (status, headers, _) = request(
        &api,
        Method::GET,
        "/v1/images/abc/json",
        &[("User-Agent", "docker/0.9 go/1.3")],
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("X-Docker-Checksum"));
    assert!(!headers.contains_key("X-Docker-Checksum-Payload"));
}
