//! Caching reverse proxy library.
//!
//! Requests flow through a composable middleware pipeline: duplicate
//! request coalescing, a stale-while-revalidate response cache backed by
//! memcached (or memory), and a guard that replaces truncated HTML.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod middleware;
pub mod observability;
pub mod proxy;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
