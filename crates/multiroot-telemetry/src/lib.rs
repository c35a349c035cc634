//! This crate contains the tracing and logging primitives used by the
//! multiroot CA binaries to instrument code.
pub mod tracing;

pub use tracing::Tracing;
