//! Pack index and multi-pack index support.
//!
//! This crate covers the lookup side of packed object storage: the
//! per-pack index (`.idx`) mapping OIDs to offsets inside one pack, and the
//! multi-pack index (MIDX) aggregating those mappings across many packs
//! into a single chunk-framed file with O(log n) cross-pack lookup.

pub mod chunk;
pub mod index;
pub mod midx;

use grix_hash::ObjectId;

pub use chunk::ChunkId;

/// Errors that can occur during pack index and MIDX operations.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("invalid pack index: {0}")]
    InvalidIndex(String),

    #[error("invalid multi-pack index: {0}")]
    InvalidMidx(String),

    #[error("missing required chunk {0}")]
    MissingChunk(ChunkId),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        expected: ObjectId,
        actual: ObjectId,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hash(#[from] grix_hash::HashError),

    #[error(transparent)]
    Util(#[from] grix_utils::UtilError),
}

/// Pack index v2 constants.
pub const IDX_SIGNATURE: [u8; 4] = [0xff, 0x74, 0x4f, 0x63]; // "\377tOc"
pub const IDX_VERSION: u32 = 2;
