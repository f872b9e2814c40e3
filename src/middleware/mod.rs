//! Request pipeline subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → coalesce.rs (optional: collapse identical in-flight requests)
//!     → cache/      (optional: serve fresh, revalidate stale, persist)
//!     → guard.rs    (buffer + inspect body, rewrite broken HTML)
//!     → proxy::backend (forward to origin)
//! ```
//!
//! Every stage is a [`Middleware`] wrapping the next [`Handler`]; [`compose`]
//! builds the chain so that the first listed middleware sees the request
//! first and the response last.
//!
//! # Design Decisions
//! - Handlers are infallible: every fault degrades to a response
//! - Response capture goes through tee.rs rather than ad-hoc buffering
//! - Middlewares hold no per-request state; shared state lives behind `Arc`

pub mod cache;
pub mod coalesce;
pub mod guard;
pub mod pattern;
pub mod tee;

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use tower::util::BoxCloneSyncService;
use tower::{service_fn, ServiceExt};

/// A type-erased request handler.
pub type Handler = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

/// A pipeline stage wrapping the next handler.
pub trait Middleware: Send + Sync {
    /// Wrap `next`, returning the decorated handler.
    fn handle(&self, next: Handler) -> Handler;
}

/// Build `middlewares[0](middlewares[1](...(terminal)))`.
pub fn compose(terminal: Handler, middlewares: &[Arc<dyn Middleware>]) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware.handle(next))
}

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    BoxCloneSyncService::new(service_fn(move |req: Request<Body>| {
        let fut = f(req);
        async move { Ok::<_, Infallible>(fut.await) }
    }))
}

/// Drive a clone of `handler` to completion for one request.
pub async fn call(handler: &Handler, req: Request<Body>) -> Response<Body> {
    match handler.clone().oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// A middleware defined by a closure over the next handler.
pub struct MiddlewareFn<F>(F);

/// Wrap a `Fn(Handler) -> Handler` closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    MiddlewareFn(f)
}

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    fn handle(&self, next: Handler) -> Handler {
        (self.0)(next)
    }
}
