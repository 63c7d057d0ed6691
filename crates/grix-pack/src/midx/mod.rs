//! Multi-pack index (MIDX) support.
//!
//! A MIDX aggregates the OID → (pack, offset) mappings of many pack files
//! into one chunk-framed file for O(log n) cross-pack lookup:
//!
//! ```text
//! Header (16): "MIDX" | version (4, 0x80000001) | hash-version (1)
//!              | hash-length (1) | base-midx count (1, 0) | chunk count (1)
//!              | pack count (4)
//! Chunk lookup table: (num_chunks + 1) × [id (4) | offset (8)]
//! Chunks: PLOO  pack-name lookup (pack_count × u32 offsets into PNAM)
//!         PNAM  null-terminated pack names, sorted
//!         OIDF  256 × u32 cumulative fan-out
//!         OIDL  N × 20-byte sorted distinct OIDs
//!         OOFF  N × [pack-id (4) | offset-or-escape (4)]
//!         LOFF  large offsets (8 bytes each), present iff needed
//! Trailer: 20-byte hash over everything before it
//! ```

mod read;
mod verify;
mod write;

pub use read::{Located, MultiPackIndex, MultiPackIndexIter};
pub use verify::{verify_midx, VerifyReport, Violation};
pub use write::{write_midx, MidxEntry};

use grix_hash::ObjectId;

use crate::chunk::ChunkId;

/// MIDX signature bytes.
pub const MIDX_SIGNATURE: [u8; 4] = *b"MIDX"; // 0x4d 0x49 0x44 0x58

/// The single supported format version.
pub const MIDX_VERSION: u32 = 0x8000_0001;

/// Fixed header size in bytes.
pub const MIDX_HEADER_SIZE: usize = 16;

/// High bit of an OOFF offset word: low 31 bits index into LOFF.
pub const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

pub const CHUNK_PACK_LOOKUP: ChunkId = ChunkId(*b"PLOO");
pub const CHUNK_PACK_NAMES: ChunkId = ChunkId(*b"PNAM");
pub const CHUNK_OID_FANOUT: ChunkId = ChunkId(*b"OIDF");
pub const CHUNK_OID_LOOKUP: ChunkId = ChunkId(*b"OIDL");
pub const CHUNK_OBJECT_OFFSETS: ChunkId = ChunkId(*b"OOFF");
pub const CHUNK_LARGE_OFFSETS: ChunkId = ChunkId(*b"LOFF");

/// Final file name for a MIDX with the given trailing hash.
pub fn midx_file_name(hash: &ObjectId) -> String {
    format!("midx-{}.midx", hash.to_hex())
}

/// Derive the `.idx` file name for a pack name stored in PNAM
/// (e.g. `test-1.pack` → `test-1.idx`).
pub(crate) fn idx_name_for(pack_name: &str) -> String {
    match pack_name.strip_suffix(".pack") {
        Some(stem) => format!("{stem}.idx"),
        None => format!("{pack_name}.idx"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_uses_lowercase_hex() {
        let oid =
            ObjectId::from_hex("00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff").unwrap();
        assert_eq!(
            midx_file_name(&oid),
            "midx-00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff.midx"
        );
    }

    #[test]
    fn idx_name_swaps_extension() {
        assert_eq!(idx_name_for("test-1.pack"), "test-1.idx");
        assert_eq!(idx_name_for("oddball"), "oddball.idx");
    }
}
