#![deny(missing_docs, missing_debug_implementations)]

//! Implements the AMQP 0-8/0-9/0-9-1 wire-level data types used by the
//! `ferrumq` broker connection engine: frame constants, protocol versions,
//! field primitives, reply codes, the method catalogue with per-version
//! decoding, and content-header basic properties.

pub mod constants;
pub mod error;
pub mod methods;
pub mod primitives;
pub mod properties;
pub mod reply_code;
pub mod version;

pub use error::DecodeError;
pub use version::{ProtocolHeader, ProtocolVersion};
