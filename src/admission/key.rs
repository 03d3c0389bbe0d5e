//! Client key derivation.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use super::credentials;
use crate::config::IdentifierMode;

/// Caller-supplied key derivation. An empty return value defers to the
/// configured identification mode.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Marker for keys that fell back to the source address.
pub const UNKNOWN_PREFIX: &str = "unknown:";

/// Hex characters of the credential digest kept in a key (128 bits).
const CREDENTIAL_DIGEST_CHARS: usize = 32;

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Turns a request into the key its quota is tracked under.
#[derive(Clone)]
pub struct KeyDeriver {
    mode: IdentifierMode,
    custom: Option<KeyFn>,
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("mode", &self.mode)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl KeyDeriver {
    pub fn new(mode: IdentifierMode) -> Self {
        Self { mode, custom: None }
    }

    /// Use `custom` ahead of the identification mode.
    pub fn with_custom(mut self, custom: KeyFn) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Derive the key for a request. Never empty.
    pub fn derive(&self, request: &Request) -> String {
        if let Some(custom) = &self.custom {
            let key = custom(request);
            if !key.is_empty() {
                return key;
            }
        }

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        self.derive_from(request.headers(), peer)
    }

    /// Derive a key from headers and the transport peer address.
    pub fn derive_from(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let ip = client_ip(headers, peer);

        let key = match self.mode {
            IdentifierMode::SourceIp => ip.clone(),
            IdentifierMode::CredentialSubject => credentials::bearer_token(headers)
                .map(|token| format!("jwt:{}", credential_digest(token)))
                .unwrap_or_else(|| ip.clone()),
            IdentifierMode::ApiKey => credentials::api_key(headers)
                .map(|key| format!("apikey:{}", key))
                .unwrap_or_else(|| ip.clone()),
            IdentifierMode::DerivedUser => credentials::bearer_token(headers)
                .or_else(|| credentials::api_key(headers))
                .map(|credential| format!("user:{}", credential_digest(credential)))
                .unwrap_or_else(|| ip.clone()),
        };

        if key.is_empty() {
            format!("{}{}", UNKNOWN_PREFIX, ip)
        } else {
            key
        }
    }
}

/// Best guess at the originating client address.
///
/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
/// Empty when none is available.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = header_str(headers, FORWARDED_FOR)
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ip) = header_str(headers, REAL_IP).map(str::trim).filter(|ip| !ip.is_empty()) {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Truncated SHA-256 of the whole presented credential.
///
/// Tokens often share a long common prefix (every HS256 JWT starts with the
/// same header), so the full value is digested. Secrets never become keys.
fn credential_digest(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CREDENTIAL_DIGEST_CHARS);
    digest
}
