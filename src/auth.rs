use crate::config::ProxyConfig;
use base64::engine::general_purpose;
use base64::Engine;
use hyper::header::{HeaderMap, HeaderName};

/// Check a Basic credential carried in `header` against the configured pair.
///
/// The header is removed from the map on every path, so the credential never
/// reaches an origin server. This also holds in anonymous mode, where the
/// check itself is skipped.
///
/// The scheme is compared case-insensitively; the decoded user and password
/// are compared byte-exact.
pub fn check_credentials(
    headers: &mut HeaderMap,
    header: &HeaderName,
    config: &ProxyConfig,
) -> bool {
    if config.allow_anonymous {
        headers.remove(header);
        return true;
    }
    let value = match headers.remove(header) {
        Some(value) => value,
        None => return false,
    };
    let value = match value.to_str() {
        Ok(value) => value,
        Err(_) => return false,
    };
    let (scheme, encoded) = match value.split_once(' ') {
        Some(parts) => parts,
        None => return false,
    };
    if !scheme.eq_ignore_ascii_case("Basic") {
        return false;
    }
    let decoded = match general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let decoded = match String::from_utf8(decoded) {
        Ok(text) => text,
        Err(_) => return false,
    };
    let (user, pass) = match decoded.split_once(':') {
        Some(pair) => pair,
        None => return false,
    };
    user == config.user && pass == config.pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, PROXY_AUTHORIZATION};
    use std::collections::HashSet;

    fn test_config(allow_anonymous: bool) -> ProxyConfig {
        ProxyConfig {
            host: "proxy.example.com".to_string(),
            user: "user".to_string(),
            pass: "pass".to_string(),
            allow_anonymous,
            restricted_ports: HashSet::new(),
            listen_addr: "127.0.0.1:1080".parse().unwrap(),
            tls_addr: "127.0.0.1:8443".parse().unwrap(),
            cert_file: None,
            key_file: None,
        }
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_valid_credentials() {
        // "user:pass"
        let mut headers = headers_with("Basic dXNlcjpwYXNz");
        assert!(check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let mut headers = headers_with("basic dXNlcjpwYXNz");
        assert!(check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));
    }

    #[test]
    fn rejects_wrong_password() {
        // "user:wrong"
        let mut headers = headers_with("Basic dXNlcjp3cm9uZw==");
        assert!(!check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn rejects_missing_header() {
        let mut headers = HeaderMap::new();
        assert!(!check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));
    }

    #[test]
    fn rejects_wrong_scheme() {
        let mut headers = headers_with("Bearer dXNlcjpwYXNz");
        assert!(!check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn rejects_malformed_value() {
        // no space between scheme and credential
        let mut headers = headers_with("BasicdXNlcjpwYXNz");
        assert!(!check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));

        // not base64
        let mut headers = headers_with("Basic !!!");
        assert!(!check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));

        // decoded value has no colon: "userpass"
        let mut headers = headers_with("Basic dXNlcnBhc3M=");
        assert!(!check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(false)
        ));
    }

    #[test]
    fn anonymous_mode_accepts_and_still_strips() {
        let mut headers = headers_with("Basic dXNlcjp3cm9uZw==");
        assert!(check_credentials(
            &mut headers,
            &PROXY_AUTHORIZATION,
            &test_config(true)
        ));
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }
}
