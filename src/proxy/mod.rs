//! Origin transport: the terminal handler of every pipeline.

pub mod backend;

pub use backend::{BackendError, BackendProxy};
