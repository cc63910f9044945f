//! Tracing helpers shared across the crate

mod error_ext;

pub use error_ext::ErrorTraceExt;
