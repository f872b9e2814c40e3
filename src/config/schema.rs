//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::middleware::cache::DEFAULT_MEMORY_CAPACITY;

/// Root configuration for the caching proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Origin server every request is forwarded to.
    pub backend: BackendConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Stale-while-revalidate response cache.
    pub cache: CacheConfig,

    /// Duplicate request coalescing.
    pub coalescing: CoalescingConfig,

    /// Broken HTML response guard.
    pub guard: GuardConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Origin server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the origin (e.g., "http://127.0.0.1:3000").
    pub url: String,

    /// Idle pooled connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Idle pooled connection timeout in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            idle_secs: 60,
        }
    }
}

/// Which backing store holds cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStoreKind {
    /// In-process map; entries are lost on restart.
    #[default]
    Memory,
    Memcached,
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    pub store: CacheStoreKind,

    /// Memcached servers as "host:port".
    pub memcached_servers: Vec<String>,

    /// Seconds a stored response is served without revalidation.
    pub soft_ttl_secs: u64,

    /// Seconds until the store purges an entry.
    pub hard_ttl_secs: u64,

    /// How long a client waits on revalidation before getting the stale copy.
    pub new_response_wait_limit_ms: u64,

    /// Soft TTL overrides by status code (e.g., `"404" = 10`).
    pub error_ttl_secs: HashMap<String, u64>,

    /// Largest body persisted, in bytes.
    pub bytes_limit: usize,

    pub key_prefix: String,

    /// Request methods eligible for caching.
    pub methods: Vec<String>,

    /// Per-operation store timeout in milliseconds.
    pub store_timeout_ms: u64,

    /// Byte budget of the in-process store; least useful entries are evicted.
    pub memory_capacity_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: CacheStoreKind::Memory,
            memcached_servers: vec!["127.0.0.1:11211".to_string()],
            soft_ttl_secs: 60,
            hard_ttl_secs: 60 * 60 * 24,
            new_response_wait_limit_ms: 1_000,
            error_ttl_secs: HashMap::new(),
            bytes_limit: 700_000,
            key_prefix: "ch/".to_string(),
            methods: vec!["GET".to_string(), "HEAD".to_string()],
            store_timeout_ms: 100,
            memory_capacity_bytes: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

/// Duplicate request coalescing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoalescingConfig {
    pub enabled: bool,

    /// Request headers that distinguish otherwise identical requests.
    pub vary_headers: Vec<String>,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vary_headers: vec!["accept-encoding".to_string()],
        }
    }
}

/// Broken response guard configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,

    /// Content-Type patterns to inspect (single `*` wildcard).
    pub content_types: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            content_types: vec!["text/html*".to_string()],
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
