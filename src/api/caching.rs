use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use chrono::{Duration, Utc};

use super::{Headers, Payload, RegistryApi};
use crate::storage::paths;

const ONE_YEAR_SECONDS: i64 = 365 * 24 * 60 * 60;

/// Cache headers for immutable image content. The epoch `Last-Modified` is
/// deliberate: layers never change, so they are always older than any client
/// clock.
pub fn default_cache_headers() -> Headers {
    let expires = Utc::now() + Duration::seconds(ONE_YEAR_SECONDS);
    vec![
        (
            "Cache-Control".to_string(),
            format!("public, max-age={ONE_YEAR_SECONDS}"),
        ),
        (
            "Expires".to_string(),
            expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        ),
        (
            "Last-Modified".to_string(),
            "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
        ),
    ]
}

/// Completion gate: an image whose in-progress marker still exists must not
/// be served.
pub async fn require_completion(api: &RegistryApi, image_id: &str) -> Option<Response> {
    let marked = api
        .storage
        .exists(&paths::image_mark_path(image_id))
        .await
        .unwrap_or(false);
    if marked {
        return Some(api.respond(
            Payload::Text("Image is being uploaded, retry later".to_string()),
            StatusCode::BAD_REQUEST,
            Vec::new(),
        ));
    }
    None
}

/// Conditional-request gate: image content never changes, so any
/// `If-Modified-Since` short-circuits to 304.
pub fn check_if_modified_since(api: &RegistryApi, headers: &HeaderMap) -> Option<Response> {
    if headers.contains_key(header::IF_MODIFIED_SINCE) {
        return Some(api.respond(
            Payload::Bool(true),
            StatusCode::NOT_MODIFIED,
            default_cache_headers(),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_headers_are_static_and_public() {
        let headers = default_cache_headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("Cache-Control"), "public, max-age=31536000");
        assert_eq!(get("Last-Modified"), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert!(get("Expires").ends_with("GMT"));
    }
}
