//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, tracing, limits, timeout)
//!     → request.rs (add / propagate request ID)
//!     → current middleware pipeline (swapped on config reload)
//!     → Send to client
//! ```

pub mod request;
pub mod server;

pub use request::{request_id, UuidRequestId, X_REQUEST_ID};
pub use server::{build_pipeline, HttpServer, PipelineFactory, ServerError};
