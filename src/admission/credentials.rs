//! Raw credential extraction.
//!
//! Admission control runs before authentication, so these helpers only read
//! what the client presented. Nothing here parses or verifies a credential.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

/// Header carrying a presented API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const BEARER_PREFIX: &str = "Bearer ";

/// The presented bearer credential, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// The presented API key, if any.
pub fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_api_key() {
        let mut headers = HeaderMap::new();
        assert_eq!(api_key(&headers), None);

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("key-123"));
        assert_eq!(api_key(&headers), Some("key-123"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("   "));
        assert_eq!(api_key(&headers), None);
    }
}
