//! Persisted cache entries and key derivation.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Storage keys never exceed this many bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Canonical request signature: `"{METHOD} {host}{path}?{query}"`.
pub fn key_source<B>(req: &Request<B>) -> String {
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default();
    format!(
        "{} {}{}?{}",
        req.method(),
        host,
        req.uri().path(),
        req.uri().query().unwrap_or_default()
    )
}

/// Storage key for a signature: `prefix + base32(sha256(source))`.
pub fn cache_key(prefix: &str, source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let mut key = format!("{}{}", prefix, BASE32_NOPAD.encode(&digest));
    if key.len() > MAX_KEY_LEN {
        // Prefix is operator-supplied; cut on a char boundary.
        let mut end = MAX_KEY_LEN;
        while !key.is_char_boundary(end) {
            end -= 1;
        }
        key.truncate(end);
    }
    key
}

/// One cache record per request signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key_source: String,
    pub key: String,
    /// Soft expiry; past this the entry is stale.
    pub expires: SystemTime,
    pub created: SystemTime,
    pub updated: Option<SystemTime>,
    pub update_count: u64,
    pub cumulative_update_duration: Duration,
    pub cached_response: Option<Arc<CachedResponse>>,
}

impl CacheEntry {
    /// A fresh, never-served entry.
    pub fn new(key_source: String, key: String) -> Self {
        let now = SystemTime::now();
        Self {
            key_source,
            key,
            expires: now,
            created: now,
            updated: None,
            update_count: 0,
            cumulative_update_duration: Duration::ZERO,
            cached_response: None,
        }
    }

    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        self.cached_response.is_some() && now < self.expires
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// An immutable captured response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_length: usize,
    /// Header pairs in arrival order; repeated names are kept. Values are
    /// raw bytes, so obs-text survives the round trip.
    #[serde(with = "header_pairs")]
    pub headers: Vec<(String, Bytes)>,
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
    pub body_hash: Option<String>,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes, body_hash: Option<String>) -> Self {
        let headers = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();
        Self {
            status: status.as_u16(),
            content_length: body.len(),
            headers,
            body,
            body_hash,
        }
    }

    /// Build a client response from the stored copy.
    pub fn to_response(&self, method: &Method) -> Response<Body> {
        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(self.body.clone())
        };
        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_maybe_shared(value.clone()),
            ) {
                headers.append(name, value);
            }
        }
        response
    }
}

mod base64_bytes {
    use bytes::Bytes;
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod header_pairs {
    use bytes::Bytes;
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(pairs: &[(String, Bytes)], serializer: S) -> Result<S::Ok, S::Error> {
        pairs
            .iter()
            .map(|(name, value)| (name.as_str(), BASE64.encode(value)))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(String, Bytes)>, D::Error> {
        Vec::<(String, String)>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, value)| {
                BASE64
                    .decode(value.as_bytes())
                    .map(|value| (name, Bytes::from(value)))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
