//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the catch-all proxy handler
//! - Wire up middleware (tracing, limits, request ID, timeout)
//! - Assemble the request pipeline from configuration
//! - Swap in a rebuilt pipeline when the configuration changes
//! - Bind server to listener and drain on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, Request},
    response::Response,
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::{CacheConfig, CacheStoreKind, ProxyConfig};
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer};
use crate::lifecycle::shutdown;
use crate::middleware::cache::{build_store, CacheHandler, CachePolicy, CacheStore};
use crate::middleware::coalesce::{DefaultIdentity, RequestBundler};
use crate::middleware::guard::BrokenResponseGuard;
use crate::middleware::pattern::PatternError;
use crate::middleware::{call, compose, Handler, Middleware};
use crate::observability::metrics;
use crate::proxy::{BackendError, BackendProxy};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("guard content types: {0}")]
    Pattern(#[from] PatternError),
}

/// Store settings whose change requires a new store.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoreSettings {
    kind: CacheStoreKind,
    servers: Vec<String>,
    timeout_ms: u64,
    memory_capacity_bytes: u64,
}

impl StoreSettings {
    fn of(config: &CacheConfig) -> Self {
        Self {
            kind: config.store,
            servers: config.memcached_servers.clone(),
            timeout_ms: config.store_timeout_ms,
            memory_capacity_bytes: config.memory_capacity_bytes,
        }
    }
}

/// Builds pipelines, keeping the cache store across rebuilds while its
/// settings are unchanged (an in-memory cache survives reloads).
#[derive(Default)]
pub struct PipelineFactory {
    store: Option<(StoreSettings, Arc<dyn CacheStore>)>,
}

impl PipelineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `coalescer → cache → guard → backend`, each stage optional.
    pub fn build(&mut self, config: &ProxyConfig) -> Result<Handler, ServerError> {
        let backend = BackendProxy::new(&config.backend, &config.timeouts)?;
        let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();

        if config.coalescing.enabled {
            let vary = config
                .coalescing
                .vary_headers
                .iter()
                .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok());
            middlewares.push(Arc::new(RequestBundler::new(DefaultIdentity::new(vary))));
        }
        if config.cache.enabled {
            let store = self.store_for(&config.cache);
            middlewares.push(Arc::new(CacheHandler::new(
                store,
                CachePolicy::from_config(&config.cache),
            )));
        }
        if config.guard.enabled {
            middlewares.push(Arc::new(BrokenResponseGuard::from_patterns(
                &config.guard.content_types,
            )?));
        }

        tracing::info!(
            backend = %config.backend.url,
            coalescing = config.coalescing.enabled,
            cache = config.cache.enabled,
            guard = config.guard.enabled,
            "Pipeline built"
        );
        Ok(compose(backend.handler(), &middlewares))
    }

    fn store_for(&mut self, config: &CacheConfig) -> Arc<dyn CacheStore> {
        let settings = StoreSettings::of(config);
        match &self.store {
            Some((current, store)) if *current == settings => store.clone(),
            _ => {
                tracing::info!(store = ?settings.kind, servers = ?settings.servers, "Cache store created");
                let store = build_store(config);
                self.store = Some((settings, store.clone()));
                store
            }
        }
    }
}

/// Build a standalone pipeline for `config`.
pub fn build_pipeline(config: &ProxyConfig) -> Result<Handler, ServerError> {
    PipelineFactory::new().build(config)
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ArcSwap<Handler>>,
    /// Caps requests in flight (`listener.max_connections`).
    pub limiter: Arc<Semaphore>,
}

/// HTTP server for the caching proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    pipeline: Arc<ArcSwap<Handler>>,
    factory: PipelineFactory,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let mut factory = PipelineFactory::new();
        let pipeline = Arc::new(ArcSwap::from_pointee(factory.build(&config)?));

        let state = AppState {
            pipeline: pipeline.clone(),
            limiter: Arc::new(Semaphore::new(config.listener.max_connections)),
        };
        let router = Self::build_router(&config, state);
        Ok(Self {
            router,
            config,
            pipeline,
            factory,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id(request),
                )
            }))
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer())
    }

    /// The pipeline currently serving requests.
    pub fn pipeline(&self) -> Arc<Handler> {
        self.pipeline.load_full()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` fires. Each config received on `config_updates` rebuilds
    /// the pipeline; listener and timeout settings need a restart.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let Self {
            router,
            pipeline,
            mut factory,
            ..
        } = self;

        let reloads = tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                match factory.build(&config) {
                    Ok(next) => {
                        pipeline.store(Arc::new(next));
                        tracing::info!("Pipeline swapped");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Could not build pipeline, keeping current");
                    }
                }
            }
        });

        let app = router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown::notified(shutdown))
            .await?;

        reloads.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Hand the request to the current pipeline.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let method = request.method().to_string();

    tracing::debug!(path = %request.uri().path(), "Proxying request");

    // The semaphore is never closed.
    let _permit = state.limiter.acquire().await.ok();
    let pipeline = state.pipeline.load_full();
    let response = call(&pipeline, request).await;

    metrics::record_request(&method, response.status().as_u16(), start_time);
    response
}
