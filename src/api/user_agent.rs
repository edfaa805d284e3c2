//! User-Agent introspection. Docker daemons advertise `name/value` pairs
//! (`docker/1.2 go/1.3 kernel/5.0 os/linux arch/amd64`) which feed the
//! repository metadata and the checksum-protocol dispatch.

use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use once_cell::sync::Lazy;
use regex::Regex;

static UA_PAIR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^\s/]+)/([^\s/]+)").expect("valid user-agent regex"));

pub fn from_headers(headers: &HeaderMap) -> &str {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// All `name/value` pairs from a User-Agent string; the last occurrence of a
/// name wins.
pub fn parse_pairs(user_agent: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for captures in UA_PAIR_REGEX.captures_iter(user_agent) {
        if let (Some(name), Some(value)) = (captures.get(1), captures.get(2)) {
            pairs.insert(name.as_str().to_string(), value.as_str().to_string());
        }
    }
    pairs
}

/// The advertised docker version as `(major, minor)`, if any.
pub fn docker_version(user_agent: &str) -> Option<(u32, u32)> {
    let version = parse_pairs(user_agent).remove("docker")?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Docker daemons before 0.10 speak the cookie-style checksum exchange and
/// read `X-Docker-Checksum`. Anything newer, or unparseable, is treated as
/// the payload-header protocol.
pub fn is_old_protocol(user_agent: &str) -> bool {
    matches!(docker_version(user_agent), Some((0, minor)) if minor < 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs() {
        let pairs = parse_pairs("docker/1.2 go/1.3 kernel/5.0 os/linux arch/amd64");
        assert_eq!(pairs["docker"], "1.2");
        assert_eq!(pairs["go"], "1.3");
        assert_eq!(pairs["kernel"], "5.0");
        assert_eq!(pairs["os"], "linux");
        assert_eq!(pairs["arch"], "amd64");
    }

    #[test]
    fn version_parsing() {
        assert_eq!(docker_version("docker/0.9 go/1.3"), Some((0, 9)));
        assert_eq!(docker_version("docker/1.10.1"), Some((1, 10)));
        assert_eq!(docker_version("curl/8.0"), None);
        assert_eq!(docker_version(""), None);
    }

    #[test]
    fn protocol_dispatch() {
        assert!(is_old_protocol("docker/0.9 go/1.3"));
        assert!(!is_old_protocol("docker/0.10 go/1.3"));
        assert!(!is_old_protocol("docker/1.2 go/1.3"));
        assert!(!is_old_protocol("curl/8.0"));
        assert!(!is_old_protocol(""));
    }
}
