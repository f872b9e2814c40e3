//! Response tee: duplicate a response body to auxiliary writers.
//!
//! # Responsibilities
//! - Copy every body chunk to registered [`BodyWriter`]s as it flows
//! - Fire header listeners exactly once, when the response head is committed
//! - Steal mode: capture the whole response in memory, never touching a client
//!
//! # Design Decisions
//! - Typestate (`Passthrough` / `Steal`) instead of a runtime mode flag
//! - Writers see bytes in real time, not after completion
//! - A pass-through capture only completes if the body streamed to the end

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use data_encoding::BASE64URL_NOPAD;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

/// A sink receiving a copy of every body chunk.
pub trait BodyWriter: Send {
    fn write(&mut self, chunk: &[u8]);
}

/// Listener invoked with the committed status and a header snapshot.
pub type HeaderListener = Box<dyn FnOnce(StatusCode, &HeaderMap) + Send>;

/// Error produced while teeing a response body.
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    #[error("response body failed: {0}")]
    Body(#[from] axum::Error),
    #[error("response body was not streamed to completion")]
    Incomplete,
}

/// Marker: bytes flow through to the client.
#[derive(Debug)]
pub struct Passthrough;

/// Marker: bytes are retained in memory only.
#[derive(Debug)]
pub struct Steal;

/// Wraps a response, duplicating its body to auxiliary writers.
pub struct ResponseTee<M> {
    writers: Vec<Box<dyn BodyWriter>>,
    listeners: Vec<HeaderListener>,
    _mode: PhantomData<M>,
}

impl<M> ResponseTee<M> {
    fn empty() -> Self {
        Self {
            writers: Vec::new(),
            listeners: Vec::new(),
            _mode: PhantomData,
        }
    }

    /// Register a writer that receives a copy of every body chunk.
    pub fn add_writer(&mut self, writer: impl BodyWriter + 'static) {
        self.writers.push(Box::new(writer));
    }

    /// Register a listener fired once when the status code is committed.
    pub fn add_header_listener<F>(&mut self, listener: F)
    where
        F: FnOnce(StatusCode, &HeaderMap) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    fn commit_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        for listener in self.listeners.drain(..) {
            listener(status, headers);
        }
    }
}

impl ResponseTee<Passthrough> {
    /// A tee that forwards the body to the client.
    pub fn new() -> Self {
        Self::empty()
    }

    /// Wrap `response` so its body is copied to the writers while streaming.
    ///
    /// The returned [`TeeDone`] resolves once the body has been streamed to
    /// the end.
    pub fn attach(mut self, response: Response<Body>) -> (Response<Body>, TeeDone) {
        let (parts, body) = response.into_parts();
        self.commit_head(parts.status, &parts.headers);

        let (done_tx, done_rx) = oneshot::channel();
        let status = parts.status;
        let headers = parts.headers.clone();
        let mut writers = self.writers;

        let body = Body::from_stream(async_stream::stream! {
            let mut data = body.into_data_stream();
            let mut content_length = 0usize;
            while let Some(chunk) = data.next().await {
                match chunk {
                    Ok(chunk) => {
                        for writer in writers.iter_mut() {
                            writer.write(&chunk);
                        }
                        content_length += chunk.len();
                        yield Ok::<Bytes, axum::Error>(chunk);
                    }
                    Err(e) => {
                        let _ = done_tx.send(Err(TeeError::Body(axum::Error::new(e.to_string()))));
                        yield Err(e);
                        return;
                    }
                }
            }
            let _ = done_tx.send(Ok(Recorded { status, headers, content_length }));
        });

        (Response::from_parts(parts, body), TeeDone(done_rx))
    }
}

impl Default for ResponseTee<Passthrough> {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTee<Steal> {
    /// A tee with no downstream client; everything stays in memory.
    pub fn steal() -> Self {
        Self::empty()
    }

    /// Drain `response` entirely into memory.
    pub async fn capture(mut self, response: Response<Body>) -> Result<CapturedResponse, TeeError> {
        let (parts, body) = response.into_parts();
        self.commit_head(parts.status, &parts.headers);

        let mut buf = BytesMut::new();
        let mut data = body.into_data_stream();
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            for writer in self.writers.iter_mut() {
                writer.write(&chunk);
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(CapturedResponse {
            status: parts.status,
            headers: parts.headers,
            content_length: buf.len(),
            body: buf.freeze(),
        })
    }
}

/// Summary of a response that streamed through a pass-through tee.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: usize,
}

/// Resolves when a pass-through tee finished streaming.
#[derive(Debug)]
pub struct TeeDone(oneshot::Receiver<Result<Recorded, TeeError>>);

impl TeeDone {
    pub async fn wait(self) -> Result<Recorded, TeeError> {
        self.0.await.unwrap_or(Err(TeeError::Incomplete))
    }
}

/// A fully captured response.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_length: usize,
}

impl CapturedResponse {
    /// Rebuild a response from the captured parts.
    pub fn to_response(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

/// Shared in-memory body buffer.
#[derive(Debug, Clone, Default)]
pub struct BodyBuffer(Arc<Mutex<BytesMut>>);

impl BodyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the accumulated bytes, leaving the buffer empty.
    pub fn take(&self) -> Bytes {
        let mut buf = self.0.lock().expect("body buffer mutex poisoned");
        buf.split().freeze()
    }
}

impl BodyWriter for BodyBuffer {
    fn write(&mut self, chunk: &[u8]) {
        self.0
            .lock()
            .expect("body buffer mutex poisoned")
            .extend_from_slice(chunk);
    }
}

/// Shared SHA-256 accumulator over the body.
#[derive(Debug, Clone, Default)]
pub struct BodyHasher(Arc<Mutex<Sha256>>);

impl BodyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `base64url(sha256(body))` without padding.
    pub fn finish(&self) -> String {
        let hasher = self.0.lock().expect("body hasher mutex poisoned").clone();
        BASE64URL_NOPAD.encode(&hasher.finalize())
    }
}

impl BodyWriter for BodyHasher {
    fn write(&mut self, chunk: &[u8]) {
        self.0
            .lock()
            .expect("body hasher mutex poisoned")
            .update(chunk);
    }
}
