//! Broken response guard.
//!
//! Buffers the whole upstream response and, for successful HTML, checks that
//! a document which opens `<html` also closes it. Truncated documents are
//! replaced with a small page that reloads itself, so clients never render
//! half a page.

use std::borrow::Cow;
use std::io::Read;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;

use crate::middleware::pattern::{PatternError, PatternSet};
use crate::middleware::tee::{CapturedResponse, ResponseTee};
use crate::middleware::{call, handler_fn, Handler, Middleware};
use crate::observability::metrics;

/// Served in place of a broken document.
pub const RELOAD_PAGE: &str = concat!(
    r#"<!DOCTYPE html><html><head><meta charset="utf-8">"#,
    r#"<script>setTimeout(function(){location.reload()}, 5000)</script></head>"#,
    r#"<body>Server Error. Reload after 5 seconds...</body></html>"#,
);

/// Outcome of decoding a captured body.
enum Decoded<'a> {
    Plain(Cow<'a, [u8]>),
    /// An encoding we cannot inspect.
    Unsupported,
}

#[derive(Clone)]
pub struct BrokenResponseGuard {
    content_types: Arc<PatternSet>,
}

impl Default for BrokenResponseGuard {
    fn default() -> Self {
        Self::new(PatternSet::any_of(["text/html*"]).unwrap_or_default())
    }
}

impl BrokenResponseGuard {
    pub fn new(content_types: PatternSet) -> Self {
        Self {
            content_types: Arc::new(content_types),
        }
    }

    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::new(PatternSet::any_of(patterns)?))
    }

    async fn serve(&self, req: Request<Body>, next: Handler) -> Response<Body> {
        let uri = req.uri().clone();
        let is_head = req.method() == Method::HEAD;
        let response = call(&next, req).await;

        let captured = match ResponseTee::steal().capture(response).await {
            Ok(captured) => captured,
            Err(e) => {
                tracing::error!(uri = %uri, error = %e, "Upstream body failed, serving reload page");
                return reload_page(HeaderMap::new());
            }
        };

        if self.is_broken(&captured) {
            tracing::error!(uri = %uri, "Broken HTML response, serving reload page");
            return reload_page(captured.headers);
        }
        forward(captured, is_head)
    }

    fn is_broken(&self, captured: &CapturedResponse) -> bool {
        if captured.status != StatusCode::OK {
            return false;
        }
        let content_type = captured
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !self.content_types.matches(content_type) {
            return false;
        }

        match decode(&captured.headers, &captured.body) {
            Ok(Decoded::Plain(body)) => has_unclosed_html(&body),
            Ok(Decoded::Unsupported) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Could not decode response body");
                true
            }
        }
    }
}

impl Middleware for BrokenResponseGuard {
    fn handle(&self, next: Handler) -> Handler {
        let this = self.clone();
        handler_fn(move |req| {
            let this = this.clone();
            let next = next.clone();
            async move { this.serve(req, next).await }
        })
    }
}

fn decode<'a>(headers: &HeaderMap, body: &'a Bytes) -> std::io::Result<Decoded<'a>> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let mut plain = Vec::new();
    match encoding.as_str() {
        "" | "identity" => return Ok(Decoded::Plain(Cow::Borrowed(&body[..]))),
        "gzip" | "x-gzip" => {
            flate2::read::GzDecoder::new(&body[..]).read_to_end(&mut plain)?;
        }
        "br" => {
            brotli::Decompressor::new(&body[..], 4096).read_to_end(&mut plain)?;
        }
        _ => return Ok(Decoded::Unsupported),
    }
    Ok(Decoded::Plain(Cow::Owned(plain)))
}

fn has_unclosed_html(body: &[u8]) -> bool {
    contains(body, b"<html") && !contains(body, b"</html>")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Forward the captured bytes as-is with an authoritative length. A `HEAD`
/// response has no body, so the origin's `Content-Length` stands.
fn forward(captured: CapturedResponse, is_head: bool) -> Response<Body> {
    let CapturedResponse {
        status,
        mut headers,
        body,
        ..
    } = captured;
    headers.remove(header::TRANSFER_ENCODING);
    if !(is_head && headers.contains_key(header::CONTENT_LENGTH)) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn reload_page(mut headers: HeaderMap) -> Response<Body> {
    metrics::record_guard_rewrite();
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(RELOAD_PAGE.len()));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );

    let mut response = Response::new(Body::from(RELOAD_PAGE));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    *response.headers_mut() = headers;
    response
}
