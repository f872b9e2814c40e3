//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, TTL ordering, status codes)
//! - Check that patterns, header names and addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::{HeaderName, Method, StatusCode};
use url::Url;

use crate::config::schema::{CacheStoreKind, ProxyConfig};
use crate::middleware::cache::entry::MAX_KEY_LEN;
use crate::middleware::pattern::PatternSet;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check `config` for semantic errors, collecting all of them.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    match Url::parse(&config.backend.url) {
        Ok(url) if url.scheme() == "http" && url.host_str().is_some() => {}
        Ok(_) => errors.push(ValidationError::new("backend.url", "must be an http:// URL with a host")),
        Err(e) => errors.push(ValidationError::new("backend.url", e.to_string())),
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be > 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }

    validate_cache(config, &mut errors);

    for name in &config.coalescing.vary_headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                "coalescing.vary_headers",
                format!("invalid header name {name:?}"),
            ));
        }
    }

    if let Err(e) = PatternSet::any_of(&config.guard.content_types) {
        errors.push(ValidationError::new("guard.content_types", e.to_string()));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new("observability.metrics_address", "not a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_cache(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let cache = &config.cache;
    if !cache.enabled {
        return;
    }

    if cache.store == CacheStoreKind::Memcached && cache.memcached_servers.is_empty() {
        errors.push(ValidationError::new("cache.memcached_servers", "required for the memcached store"));
    }
    if cache.hard_ttl_secs < cache.soft_ttl_secs {
        errors.push(ValidationError::new("cache.hard_ttl_secs", "must not be shorter than soft_ttl_secs"));
    }
    if cache.hard_ttl_secs > u64::from(u32::MAX) {
        errors.push(ValidationError::new("cache.hard_ttl_secs", "too large"));
    }
    if cache.store_timeout_ms == 0 {
        errors.push(ValidationError::new("cache.store_timeout_ms", "must be > 0"));
    }
    if cache.store == CacheStoreKind::Memory && cache.memory_capacity_bytes == 0 {
        errors.push(ValidationError::new("cache.memory_capacity_bytes", "must be > 0"));
    }
    // Leave room for the digest.
    if cache.key_prefix.len() > MAX_KEY_LEN / 2 {
        errors.push(ValidationError::new("cache.key_prefix", "too long"));
    }
    if cache.key_prefix.bytes().any(|b| b <= b' ' || b == 0x7f) {
        errors.push(ValidationError::new("cache.key_prefix", "must not contain spaces or control characters"));
    }

    for code in cache.error_ttl_secs.keys() {
        let valid = code
            .parse::<u16>()
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .is_some();
        if !valid {
            errors.push(ValidationError::new(
                "cache.error_ttl_secs",
                format!("{code:?} is not a status code"),
            ));
        }
    }

    for method in &cache.methods {
        if Method::from_bytes(method.as_bytes()).is_err() {
            errors.push(ValidationError::new("cache.methods", format!("invalid method {method:?}")));
        }
    }
}
