//! Shared wire types for the triwire RPC client.
//!
//! This crate holds the protocol-agnostic pieces of the engine:
//!
//! - [`code`]: RPC status codes
//! - [`error`]: the caller-facing error type with typed details
//! - [`headers`]: case-insensitive multi-valued metadata
//! - [`envelope`]: 5-byte message framing and the incremental frame buffer
//! - [`compression`]: named compression pools
//! - [`codec`]: serialization seams (codec, strategy, error-detail parser)
//! - [`result`]: the `Headers` / `Message` / `Complete` stream result model

mod code;
mod codec;
mod compression;
mod envelope;
mod error;
mod headers;
mod result;

pub use code::*;
pub use codec::*;
pub use compression::*;
pub use envelope::*;
pub use error::*;
pub use headers::*;
pub use result::*;
