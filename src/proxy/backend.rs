//! Forwarding to the origin server.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the configured origin
//! - Strip hop-by-hop headers in both directions
//! - Add `X-Forwarded-For` for the client peer
//! - Map transport failures to `502 Bad Gateway`
//!
//! # Design Decisions
//! - The incoming `Host` header is kept, so the origin sees the public host
//! - Response bodies are streamed, never buffered here

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use url::Url;

use crate::config::{BackendConfig, TimeoutConfig};
use crate::middleware::{handler_fn, Handler};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Forwards every request to a single origin.
#[derive(Clone)]
pub struct BackendProxy {
    client: Client<HttpConnector, Body>,
    authority: Authority,
    /// Origin path prefix without a trailing slash.
    base_path: String,
}

impl BackendProxy {
    pub fn new(backend: &BackendConfig, timeouts: &TimeoutConfig) -> Result<Self, BackendError> {
        let invalid = |reason: String| BackendError::InvalidUrl {
            url: backend.url.clone(),
            reason,
        };

        let url = Url::parse(&backend.url).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid("only http origins are supported".into()));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host".into()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let authority = Authority::from_str(&authority).map_err(|e| invalid(e.to_string()))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(timeouts.idle_secs))
            .pool_max_idle_per_host(backend.pool_max_idle_per_host)
            .build(connector);

        Ok(Self {
            client,
            authority,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// The terminal handler of the pipeline.
    pub fn handler(&self) -> Handler {
        let this = self.clone();
        handler_fn(move |req| {
            let this = this.clone();
            async move { this.forward(req).await }
        })
    }

    fn target_uri(&self, uri: &Uri) -> Uri {
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        let joined = format!("{}{}", self.base_path, path_and_query);

        let mut parts = uri.clone().into_parts();
        parts.scheme = Some(Scheme::HTTP);
        parts.authority = Some(self.authority.clone());
        parts.path_and_query = PathAndQuery::from_str(&joined).ok().or(parts.path_and_query);
        Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
    }

    async fn forward(&self, req: Request<Body>) -> Response<Body> {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let (mut parts, body) = req.into_parts();
        parts.uri = self.target_uri(&parts.uri);
        strip_hop_by_hop(&mut parts.headers);
        if let Some(ip) = peer {
            append_forwarded_for(&mut parts.headers, &ip.to_string());
        }

        let request_id = parts
            .headers
            .get(crate::http::X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let uri = parts.uri.clone();

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, uri = %uri, error = %e, "Upstream error");
                let mut response = Response::new(Body::from("Upstream request failed"));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    // Upgrades are not proxied.
    headers.remove(header::UPGRADE);
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: &str) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
