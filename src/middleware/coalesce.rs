//! Duplicate request coalescing.
//!
//! # Responsibilities
//! - Collapse concurrent requests with the same identity into one backend call
//! - Fan the single captured response out to every waiting client
//!
//! # Design Decisions
//! - The registry lock covers map membership only, never the backend call
//! - Followers register their waiter under the same lock that finds the group,
//!   and completion removes the group under that lock before fanning out, so
//!   no request can attach to a group that is already draining
//! - The leader's call runs on its own task behind a completion guard: if it
//!   panics or is dropped, every waiter gets a 502 instead of hanging

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, HeaderName, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use crate::middleware::tee::{CapturedResponse, ResponseTee};
use crate::middleware::{call, handler_fn, Handler, Middleware};
use crate::observability::metrics;

/// Derives the coalescing identity of a request.
///
/// `None` opts the request out of coalescing entirely.
pub trait RequestIdentity: Send + Sync {
    fn identify(&self, req: &Request<Body>) -> Option<String>;
}

impl<F> RequestIdentity for F
where
    F: Fn(&Request<Body>) -> Option<String> + Send + Sync,
{
    fn identify(&self, req: &Request<Body>) -> Option<String> {
        self(req)
    }
}

/// Identity from method, host, path and query plus selected request headers.
///
/// Only `GET` and `HEAD` are coalesced, and never when the request carries
/// credentials.
#[derive(Debug, Clone)]
pub struct DefaultIdentity {
    vary_headers: Vec<HeaderName>,
}

impl DefaultIdentity {
    pub fn new(vary_headers: impl IntoIterator<Item = HeaderName>) -> Self {
        Self {
            vary_headers: vary_headers.into_iter().collect(),
        }
    }
}

impl Default for DefaultIdentity {
    fn default() -> Self {
        Self::new([header::ACCEPT_ENCODING])
    }
}

impl RequestIdentity for DefaultIdentity {
    fn identify(&self, req: &Request<Body>) -> Option<String> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return None;
        }
        if req.headers().contains_key(header::AUTHORIZATION) {
            return None;
        }

        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or_default();
        let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());

        let mut identity = format!("{} {}{}", req.method(), host, target);
        for name in &self.vary_headers {
            identity.push('\n');
            identity.push_str(name.as_str());
            identity.push(':');
            for value in req.headers().get_all(name) {
                identity.push_str(&String::from_utf8_lossy(value.as_bytes()));
                identity.push(',');
            }
        }
        Some(identity)
    }
}

type Waiter = oneshot::Sender<Arc<CapturedResponse>>;

#[derive(Debug, PartialEq, Eq)]
enum Role {
    Leader,
    Follower,
}

/// In-flight groups keyed by identity.
#[derive(Default)]
struct Registry {
    groups: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl Registry {
    /// Add `waiter` to the group for `key`, creating the group if needed.
    fn join(&self, key: &str, waiter: Waiter) -> Role {
        let mut groups = self.groups.lock().expect("coalescing registry mutex poisoned");
        match groups.get_mut(key) {
            Some(waiters) => {
                waiters.push(waiter);
                Role::Follower
            }
            None => {
                groups.insert(key.to_string(), vec![waiter]);
                Role::Leader
            }
        }
    }

    /// Remove the group for `key` and hand `response` to all its waiters.
    fn complete(&self, key: &str, response: Arc<CapturedResponse>) {
        let waiters = self
            .groups
            .lock()
            .expect("coalescing registry mutex poisoned")
            .remove(key)
            .unwrap_or_default();
        for waiter in waiters {
            // A waiter whose client went away has dropped its receiver.
            let _ = waiter.send(response.clone());
        }
    }

    fn len(&self) -> usize {
        self.groups.lock().expect("coalescing registry mutex poisoned").len()
    }
}

/// Completes a group exactly once, with a 502 if never completed explicitly.
struct Completion {
    registry: Arc<Registry>,
    key: String,
    done: bool,
}

impl Completion {
    fn finish(mut self, response: CapturedResponse) {
        self.done = true;
        self.registry.complete(&self.key, Arc::new(response));
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.done {
            tracing::error!(identity = %self.key, "Coalesced request aborted, failing waiters");
            self.registry
                .complete(&self.key, Arc::new(empty_capture(StatusCode::BAD_GATEWAY)));
        }
    }
}

fn empty_capture(status: StatusCode) -> CapturedResponse {
    CapturedResponse {
        status,
        headers: Default::default(),
        body: Default::default(),
        content_length: 0,
    }
}

/// Coalescer middleware.
#[derive(Clone)]
pub struct RequestBundler {
    identity: Arc<dyn RequestIdentity>,
    registry: Arc<Registry>,
}

impl RequestBundler {
    pub fn new(identity: impl RequestIdentity + 'static) -> Self {
        Self {
            identity: Arc::new(identity),
            registry: Arc::default(),
        }
    }

    /// Number of groups currently waiting on a backend call.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    async fn serve(&self, req: Request<Body>, next: Handler) -> Response<Body> {
        let Some(key) = self.identity.identify(&req) else {
            metrics::record_coalesced("bypass");
            return call(&next, req).await;
        };

        let (tx, rx) = oneshot::channel();
        match self.registry.join(&key, tx) {
            Role::Leader => {
                metrics::record_coalesced("leader");
                let completion = Completion {
                    registry: self.registry.clone(),
                    key: key.clone(),
                    done: false,
                };
                tokio::spawn(async move {
                    let response = call(&next, req).await;
                    match ResponseTee::steal().capture(response).await {
                        Ok(captured) => completion.finish(captured),
                        Err(e) => {
                            tracing::warn!(identity = %completion.key, error = %e, "Coalesced response body failed");
                            completion.finish(empty_capture(StatusCode::BAD_GATEWAY));
                        }
                    }
                });
            }
            Role::Follower => {
                metrics::record_coalesced("follower");
                tracing::debug!(identity = %key, "Joined in-flight request");
            }
        }

        match rx.await {
            Ok(captured) => captured.to_response(),
            Err(_) => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}

impl Middleware for RequestBundler {
    fn handle(&self, next: Handler) -> Handler {
        let this = self.clone();
        handler_fn(move |req| {
            let this = this.clone();
            let next = next.clone();
            async move { this.serve(req, next).await }
        })
    }
}
