//! Stale-while-revalidate cache coordinator.
//!
//! # State Machine (per request)
//! ```text
//! LOOKUP ─┬─ fresh entry ──────────────▶ HIT (serve stored copy)
//!         ├─ no stored response ───────▶ REVALIDATE-SYNC (tee to client, persist on completion)
//!         └─ stale stored response ────▶ REVALIDATE-ASYNC ─┬─ backend first ─▶ SERVE-FRESH
//!                                                          └─ timer first ───▶ SERVE-STALE
//! ```
//!
//! # Design Decisions
//! - The store is the system of record; every request re-reads its entry
//! - Store faults bypass caching for that request only
//! - A stale entry's expiry is pushed forward before revalidating, narrowing
//!   (not closing) the window in which several requests revalidate at once
//! - A slow revalidation still persists after the client got the stale copy

pub mod entry;
pub mod memcached;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::body::Body;
use axum::http::{Method, Request, Response};
use tokio::sync::oneshot;

use crate::config::{CacheConfig, CacheStoreKind};
use crate::middleware::tee::{BodyBuffer, BodyHasher, ResponseTee};
use crate::middleware::{call, handler_fn, Handler, Middleware};
use crate::observability::metrics;

pub use entry::{cache_key, key_source, CacheEntry, CachedResponse};
pub use memcached::MemcachedStore;
pub use store::{CacheStore, MemoryStore, StoreError, StoreItem, DEFAULT_MEMORY_CAPACITY};

/// Freshness, expiry and size rules for cached responses.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub new_response_wait_limit: Duration,
    /// Soft TTL overrides keyed by status code.
    pub error_ttl: HashMap<u16, Duration>,
    /// Responses larger than this are served but not persisted.
    pub bytes_limit: usize,
    pub key_prefix: String,
    pub methods: Vec<Method>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        let error_ttl = config
            .error_ttl_secs
            .iter()
            .filter_map(|(code, secs)| Some((code.parse().ok()?, Duration::from_secs(*secs))))
            .collect();
        let methods = config
            .methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
            .collect();
        Self {
            soft_ttl: Duration::from_secs(config.soft_ttl_secs),
            hard_ttl: Duration::from_secs(config.hard_ttl_secs),
            new_response_wait_limit: Duration::from_millis(config.new_response_wait_limit_ms),
            error_ttl,
            bytes_limit: config.bytes_limit,
            key_prefix: config.key_prefix.clone(),
            methods,
        }
    }

    /// Soft TTL for a freshly captured response.
    pub fn ttl_for(&self, status: u16) -> Duration {
        self.error_ttl.get(&status).copied().unwrap_or(self.soft_ttl)
    }

    pub fn admits(&self, content_length: usize) -> bool {
        self.bytes_limit == 0 || content_length <= self.bytes_limit
    }

    fn hard_ttl_secs(&self) -> u32 {
        u32::try_from(self.hard_ttl.as_secs()).unwrap_or(u32::MAX)
    }
}

/// Build the store selected by configuration.
pub fn build_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
    match config.store {
        CacheStoreKind::Memory => Arc::new(MemoryStore::with_capacity(config.memory_capacity_bytes)),
        CacheStoreKind::Memcached => Arc::new(MemcachedStore::new(
            config.memcached_servers.iter().cloned(),
            Duration::from_millis(config.store_timeout_ms),
        )),
    }
}

struct Inner {
    store: Arc<dyn CacheStore>,
    policy: CachePolicy,
}

/// Cache coordinator middleware.
#[derive(Clone)]
pub struct CacheHandler {
    inner: Arc<Inner>,
}

impl Middleware for CacheHandler {
    fn handle(&self, next: Handler) -> Handler {
        let this = self.clone();
        handler_fn(move |req| {
            let this = this.clone();
            let next = next.clone();
            async move { this.serve(req, next).await }
        })
    }
}

impl CacheHandler {
    pub fn new(store: Arc<dyn CacheStore>, policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(Inner { store, policy }),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    async fn serve(&self, req: Request<Body>, next: Handler) -> Response<Body> {
        if !self.policy().methods.contains(req.method()) {
            metrics::record_cache_event("bypass");
            return call(&next, req).await;
        }

        // `Body` is not `Sync`; no borrow of the request may live across an await.
        let entry = match self.lookup(key_source(&req)).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Cache store unavailable, passing through");
                metrics::record_cache_event("store_error");
                return call(&next, req).await;
            }
        };

        if entry.is_fresh_at(SystemTime::now()) {
            if let Some(cached) = &entry.cached_response {
                metrics::record_cache_event("hit");
                return cached.to_response(req.method());
            }
        }

        let started = Instant::now();
        match entry.cached_response.clone() {
            None => self.revalidate_new(entry, req, next, started).await,
            Some(stale) => self.revalidate_stale(entry, stale, req, next, started).await,
        }
    }

    /// Fetch the entry for a request signature, or a blank one if none is
    /// stored.
    async fn lookup(&self, source: String) -> Result<CacheEntry, StoreError> {
        let key = cache_key(&self.policy().key_prefix, &source);

        match self.inner.store.get(&key).await? {
            None => Ok(CacheEntry::new(source, key)),
            Some(bytes) => match CacheEntry::from_bytes(&bytes) {
                Ok(entry) => Ok(entry),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                    Ok(CacheEntry::new(source, key))
                }
            },
        }
    }

    /// No stored response: the client waits on the backend, bytes stream
    /// through to it, and the capture is persisted once complete.
    async fn revalidate_new(
        &self,
        entry: CacheEntry,
        req: Request<Body>,
        next: Handler,
        started: Instant,
    ) -> Response<Body> {
        let buffer = BodyBuffer::new();
        let hasher = BodyHasher::new();
        let mut tee = ResponseTee::new();
        tee.add_writer(buffer.clone());
        tee.add_writer(hasher.clone());

        let response = call(&next, req).await;
        let (response, done) = tee.attach(response);

        let this = self.clone();
        tokio::spawn(async move {
            match done.wait().await {
                Ok(recorded) => {
                    let cached = CachedResponse::new(
                        recorded.status,
                        &recorded.headers,
                        buffer.take(),
                        Some(hasher.finish()),
                    );
                    tracing::info!(
                        event = "CREATE",
                        key = %entry.key,
                        key_source = %entry.key_source,
                        status = cached.status,
                        elapsed = ?started.elapsed(),
                        "Cache entry created"
                    );
                    metrics::record_cache_event("create");
                    this.persist(entry, Arc::new(cached), started).await;
                }
                Err(e) => {
                    tracing::debug!(key = %entry.key, error = %e, "Response not fully captured, not caching");
                }
            }
        });

        response
    }

    /// Stale stored response: revalidate in the background and race the
    /// result against the wait limit.
    async fn revalidate_stale(
        &self,
        mut entry: CacheEntry,
        stale: Arc<CachedResponse>,
        req: Request<Body>,
        next: Handler,
        started: Instant,
    ) -> Response<Body> {
        let policy = self.policy();
        if let Err(e) = self.write(&mut entry, policy.soft_ttl).await {
            tracing::debug!(key = %entry.key, error = %e, "Could not extend stale entry");
        }

        let method = req.method().clone();
        let key = entry.key.clone();
        let (fresh_tx, fresh_rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let hasher = BodyHasher::new();
            let mut tee = ResponseTee::steal();
            tee.add_writer(hasher.clone());

            let response = call(&next, req).await;
            match tee.capture(response).await {
                Ok(captured) => {
                    let fresh = Arc::new(CachedResponse::new(
                        captured.status,
                        &captured.headers,
                        captured.body,
                        Some(hasher.finish()),
                    ));
                    this.persist(entry, fresh.clone(), started).await;
                    let _ = fresh_tx.send(fresh);
                }
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "Revalidation failed, keeping stale response");
                }
            }
        });

        tokio::select! {
            fresh = fresh_rx => match fresh {
                Ok(fresh) => {
                    metrics::record_cache_event("fresh");
                    fresh.to_response(&method)
                }
                Err(_) => {
                    metrics::record_cache_event("stale");
                    stale.to_response(&method)
                }
            },
            _ = tokio::time::sleep(policy.new_response_wait_limit) => {
                tracing::info!(
                    event = "OLDRES",
                    key = %key,
                    status = stale.status,
                    elapsed = ?started.elapsed(),
                    "Serving stale response"
                );
                metrics::record_cache_event("stale");
                stale.to_response(&method)
            }
        }
    }

    /// Store a new response on `entry` unless it exceeds the size limit.
    async fn persist(&self, mut entry: CacheEntry, cached: Arc<CachedResponse>, started: Instant) {
        let policy = self.policy();
        let ttl = policy.ttl_for(cached.status);

        if !policy.admits(cached.content_length) {
            tracing::info!(
                event = "SKIPBL",
                key = %entry.key,
                key_source = %entry.key_source,
                status = cached.status,
                content_length = cached.content_length,
                bytes_limit = policy.bytes_limit,
                "Response exceeds bytes limit, not caching"
            );
            metrics::record_cache_event("skip");
            return;
        }

        entry.updated = Some(SystemTime::now());
        entry.update_count += 1;
        entry.cumulative_update_duration += started.elapsed();
        entry.cached_response = Some(cached);

        match self.write(&mut entry, ttl).await {
            Ok(()) => {
                tracing::info!(
                    event = "UPDATE",
                    key = %entry.key,
                    key_source = %entry.key_source,
                    ttl = ?ttl,
                    status = entry.cached_response.as_ref().map_or(0, |c| c.status),
                    elapsed = ?started.elapsed(),
                    "Cache entry updated"
                );
                metrics::record_cache_event("update");
            }
            Err(e) => {
                tracing::warn!(key = %entry.key, error = %e, "Could not save cache entry");
                metrics::record_cache_event("store_error");
            }
        }
    }

    /// Set `expires = now + ttl` and write the entry with the hard TTL.
    async fn write(&self, entry: &mut CacheEntry, ttl: Duration) -> Result<(), StoreError> {
        entry.expires = SystemTime::now() + ttl;
        let value = entry
            .to_bytes()
            .map_err(|e| StoreError::Protocol(format!("could not encode entry: {e}")))?;
        self.inner
            .store
            .set(StoreItem {
                key: entry.key.clone(),
                value,
                expiration_secs: self.policy().hard_ttl_secs(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::body_string;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend returning `"<prefix>-<n>"` for the n-th call.
    fn counting_backend(prefix: &'static str, delay: Duration) -> (Handler, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler = handler_fn(move |_req| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                let mut response = Response::new(Body::from(format!("{prefix}-{n}")));
                response.headers_mut().insert("content-type", "text/plain".parse().unwrap());
                response
            }
        });
        (handler, hits)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("host", "example.com")
            .body(Body::empty())
            .unwrap()
    }

    fn policy() -> CachePolicy {
        CachePolicy {
            soft_ttl: Duration::from_secs(60),
            hard_ttl: Duration::from_secs(3600),
            new_response_wait_limit: Duration::from_millis(50),
            error_ttl: HashMap::new(),
            bytes_limit: 1024,
            key_prefix: "ch/".into(),
            methods: vec![Method::GET, Method::HEAD],
        }
    }

    /// The decoded entry for `uri`; bytes that do not decode count as absent.
    async fn stored_entry(store: &MemoryStore, uri: &str) -> Option<CacheEntry> {
        let key = cache_key("ch/", &key_source(&get(uri)));
        store
            .get(&key)
            .await
            .unwrap()
            .and_then(|bytes| CacheEntry::from_bytes(&bytes).ok())
    }

    /// Poll until the background persist lands.
    async fn wait_for_entry<F>(store: &MemoryStore, uri: &str, accept: F) -> CacheEntry
    where
        F: Fn(&CacheEntry) -> bool,
    {
        for _ in 0..100 {
            if let Some(entry) = stored_entry(store, uri).await {
                if accept(&entry) {
                    return entry;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entry for {uri} never persisted");
    }

    async fn seed(store: &MemoryStore, uri: &str, body: &'static str, expires: SystemTime) {
        let source = key_source(&get(uri));
        let mut entry = CacheEntry::new(source.clone(), cache_key("ch/", &source));
        entry.expires = expires;
        entry.cached_response = Some(Arc::new(CachedResponse::new(
            StatusCode::OK,
            &Default::default(),
            bytes::Bytes::from_static(body.as_bytes()),
            None,
        )));
        store
            .set(StoreItem { key: entry.key.clone(), value: entry.to_bytes().unwrap(), expiration_secs: 0 })
            .await
            .unwrap();
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Timeout)
        }

        async fn set(&self, _item: StoreItem) -> Result<(), StoreError> {
            Err(StoreError::Timeout)
        }
    }

    #[test]
    fn test_policy_ttl_lookup() {
        let mut policy = policy();
        policy.error_ttl.insert(404, Duration::from_secs(5));
        assert_eq!(policy.ttl_for(404), Duration::from_secs(5));
        assert_eq!(policy.ttl_for(200), Duration::from_secs(60));
        assert!(policy.admits(1024));
        assert!(!policy.admits(1025));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = CacheConfig::default();
        config.error_ttl_secs.insert("503".into(), 2);
        config.new_response_wait_limit_ms = 250;
        let policy = CachePolicy::from_config(&config);
        assert_eq!(policy.ttl_for(503), Duration::from_secs(2));
        assert_eq!(policy.new_response_wait_limit, Duration::from_millis(250));
        assert!(policy.methods.contains(&Method::GET));
    }

    #[tokio::test]
    async fn test_new_entry_served_from_backend_then_cached() {
        let store = Arc::new(MemoryStore::new());
        let (backend, hits) = counting_backend("v", Duration::ZERO);
        let handler = CacheHandler::new(store.clone(), policy()).handle(backend);

        let response = call(&handler, get("/page")).await;
        assert_eq!(body_string(response).await, "v-1");

        let entry = wait_for_entry(&store, "/page", |e| e.cached_response.is_some()).await;
        assert_eq!(entry.update_count, 1);
        assert!(entry.cached_response.unwrap().body_hash.is_some());

        // Fresh hit: backend not invoked again.
        let response = call(&handler, get("/page")).await;
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(body_string(response).await, "v-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_backend() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "/fresh", "stored", SystemTime::now() + Duration::from_secs(60)).await;
        let (backend, hits) = counting_backend("v", Duration::ZERO);
        let handler = CacheHandler::new(store.clone(), policy()).handle(backend);

        let response = call(&handler, get("/fresh")).await;
        assert_eq!(body_string(response).await, "stored");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_revalidated_within_wait_limit() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "/s", "old", SystemTime::now() - Duration::from_secs(1)).await;
        let (backend, _) = counting_backend("new", Duration::ZERO);
        let mut policy = policy();
        policy.new_response_wait_limit = Duration::from_secs(5);
        let handler = CacheHandler::new(store.clone(), policy).handle(backend);

        let response = call(&handler, get("/s")).await;
        assert_eq!(body_string(response).await, "new-1");
    }

    #[tokio::test]
    async fn test_slow_revalidation_serves_stale_then_persists() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "/slow", "old", SystemTime::now() - Duration::from_secs(1)).await;
        let (backend, hits) = counting_backend("new", Duration::from_millis(300));
        let handler = CacheHandler::new(store.clone(), policy()).handle(backend);

        let response = call(&handler, get("/slow")).await;
        assert_eq!(body_string(response).await, "old");

        let entry = wait_for_entry(&store, "/slow", |e| e.update_count == 1).await;
        assert_eq!(&entry.cached_response.unwrap().body[..], b"new-1");

        let response = call(&handler, get("/slow")).await;
        assert_eq!(body_string(response).await, "new-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_extended_before_revalidation() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "/lock", "old", SystemTime::now() - Duration::from_secs(1)).await;
        let (backend, _) = counting_backend("new", Duration::from_millis(500));
        let handler = CacheHandler::new(store.clone(), policy()).handle(backend);

        let response = call(&handler, get("/lock")).await;
        assert_eq!(body_string(response).await, "old");

        // The backend is still running, yet the entry already looks fresh.
        let entry = stored_entry(&store, "/lock").await.unwrap();
        assert!(entry.expires > SystemTime::now());
        assert_eq!(entry.update_count, 0);
    }

    #[tokio::test]
    async fn test_oversized_response_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let big = "x".repeat(2048);
        let backend = handler_fn(move |_req| {
            let big = big.clone();
            async move { Response::new(Body::from(big)) }
        });
        let handler = CacheHandler::new(store.clone(), policy()).handle(backend);

        let response = call(&handler, get("/big")).await;
        assert_eq!(body_string(response).await.len(), 2048);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stored_entry(&store, "/big").await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_revalidation_keeps_stored_response() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "/grow", "small", SystemTime::now() - Duration::from_secs(1)).await;
        let before = stored_entry(&store, "/grow").await.unwrap().cached_response;

        let big = "y".repeat(2048);
        let backend = handler_fn(move |_req| {
            let big = big.clone();
            async move { Response::new(Body::from(big)) }
        });
        let mut policy = policy();
        policy.new_response_wait_limit = Duration::from_secs(5);
        let handler = CacheHandler::new(store.clone(), policy).handle(backend);

        // The current client still gets the oversized body.
        let response = call(&handler, get("/grow")).await;
        assert_eq!(body_string(response).await.len(), 2048);

        let after = stored_entry(&store, "/grow").await.unwrap();
        assert_eq!(after.cached_response, before);
        assert_eq!(after.update_count, 0);
    }

    #[tokio::test]
    async fn test_error_ttl_applies_to_status() {
        let store = Arc::new(MemoryStore::new());
        let backend = handler_fn(|_req| async {
            let mut response = Response::new(Body::from("gone"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        });
        let mut policy = policy();
        policy.error_ttl.insert(404, Duration::ZERO);
        let handler = CacheHandler::new(store.clone(), policy).handle(backend);

        let _ = body_string(call(&handler, get("/missing")).await).await;
        let entry = wait_for_entry(&store, "/missing", |e| e.cached_response.is_some()).await;
        // Zero soft TTL: stored, but already stale.
        assert!(!entry.is_fresh_at(SystemTime::now()));
    }

    #[test]
    fn test_serve_future_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let (backend, _) = counting_backend("send", Duration::ZERO);
        let cache = CacheHandler::new(Arc::new(MemoryStore::new()), policy());
        assert_send(cache.serve(get("/send"), backend));
    }

    #[tokio::test]
    async fn test_store_fault_passes_through() {
        let (backend, hits) = counting_backend("direct", Duration::ZERO);
        let handler = CacheHandler::new(Arc::new(FailingStore), policy()).handle(backend);

        let response = call(&handler, get("/x")).await;
        assert_eq!(body_string(response).await, "direct-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecodable_entry_rebuilt() {
        let store = Arc::new(MemoryStore::new());
        let key = cache_key("ch/", &key_source(&get("/bad")));
        store
            .set(StoreItem { key, value: b"{garbage".to_vec(), expiration_secs: 0 })
            .await
            .unwrap();
        let (backend, _) = counting_backend("rebuilt", Duration::ZERO);
        let handler = CacheHandler::new(store.clone(), policy()).handle(backend);

        let response = call(&handler, get("/bad")).await;
        assert_eq!(body_string(response).await, "rebuilt-1");
        wait_for_entry(&store, "/bad", |e| e.cached_response.is_some()).await;
    }

    #[tokio::test]
    async fn test_uncached_method_passes_through() {
        let store = Arc::new(MemoryStore::new());
        let (backend, hits) = counting_backend("post", Duration::ZERO);
        let handler = CacheHandler::new(store.clone(), policy()).handle(backend);

        for _ in 0..2 {
            let req = Request::builder()
                .method(Method::POST)
                .uri("/form")
                .header("host", "example.com")
                .body(Body::empty())
                .unwrap();
            let _ = body_string(call(&handler, req).await).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(store.is_empty().await);
    }
}
