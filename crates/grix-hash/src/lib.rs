//! Object identity for the grix object-store toolkit.
//!
//! Provides the `ObjectId` type (a fixed-width content hash, totally ordered
//! by unsigned byte comparison, with its hex codec built in), streaming hash
//! computation with trailing-checksum helpers, and the 256-entry fan-out
//! table that accelerates sorted-OID binary searches.

mod algorithm;
pub mod fanout;
pub mod hasher;
mod oid;

pub use algorithm::HashAlgorithm;
pub use fanout::FanoutTable;
pub use oid::ObjectId;

/// Errors produced by hash and OID operations.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hex character at position {position}: '{character}'")]
    InvalidHex { position: usize, character: char },

    #[error("invalid hex length: expected {expected}, got {actual}")]
    InvalidHexLength { expected: usize, actual: usize },

    #[error("invalid hash length: expected {expected} bytes, got {actual}")]
    InvalidHashLength { expected: usize, actual: usize },

    #[error("fan-out table not monotonic at bucket {bucket}")]
    FanoutNotMonotonic { bucket: usize },

    #[error("trailing checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: ObjectId, computed: ObjectId },

    #[error("SHA-1 collision detected")]
    Sha1Collision,
}
