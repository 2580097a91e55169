//! Shared error types for the shielded STM runtime.
//!
//! This crate has no dependency on the runtime itself so that downstream
//! crates can match on `Error` without pulling in the concurrency engine.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;

pub use error::Error;

/// Convenience alias used throughout the runtime crate.
pub type Result<T> = std::result::Result<T, Error>;
