//! Chunk-framed file primitives.
//!
//! A chunk file is a fixed header, a lookup table of
//! `num_chunks + 1` records `[chunk_id (4) | file_offset (8)]`, the chunk
//! payloads back to back, and a trailing content hash over everything
//! before it. The terminating table record has id 0 and the offset of the
//! trailing hash. All integers are big-endian.
//!
//! Chunk lengths are declared before anything is written, so every table
//! offset is known up front and the whole table (terminator included) goes
//! out with the header; the rolling hash forbids seeking back to patch it
//! later. A payload that does not match its declared length is a bug in
//! the caller, not a recoverable condition.

use std::fmt;
use std::io::Write;

use grix_hash::hasher::HashingWriter;
use grix_hash::{HashAlgorithm, ObjectId};

use crate::PackError;

/// Size of one lookup-table record: 4-byte id + 8-byte offset.
pub const CHUNK_TOC_ENTRY_SIZE: usize = 12;

/// A four-byte chunk identifier, conventionally printable ASCII.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(pub [u8; 4]);

impl ChunkId {
    pub const fn as_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn from_u32(v: u32) -> Self {
        Self(v.to_be_bytes())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            for &b in &self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.as_u32())
        }
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({self})")
    }
}

/// Streaming writer for chunk-framed files.
///
/// Usage: declare every chunk with [`add_chunk`](ChunkWriter::add_chunk),
/// call [`begin`](ChunkWriter::begin) with the header bytes, stream each
/// payload through [`write_chunk`](ChunkWriter::write_chunk) in declaration
/// order, then [`finalize`](ChunkWriter::finalize) to append the trailing
/// hash.
pub struct ChunkWriter<W: Write> {
    out: HashingWriter<W>,
    /// Declared (id, payload length) pairs, in file order.
    chunks: Vec<(ChunkId, u64)>,
    /// Index of the next chunk expected by `write_chunk`.
    cursor: usize,
    started: bool,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(out: W, algo: HashAlgorithm) -> Self {
        Self {
            out: HashingWriter::new(out, algo),
            chunks: Vec::new(),
            cursor: 0,
            started: false,
        }
    }

    /// Declare a chunk. Must be called for every chunk before `begin`.
    pub fn add_chunk(&mut self, id: ChunkId, len: u64) {
        assert!(!self.started, "add_chunk after begin");
        assert_ne!(id.as_u32(), 0, "chunk id 0 is reserved for the terminator");
        self.chunks.push((id, len));
    }

    /// Offset of the trailing hash, derivable once all chunks are declared.
    fn trailer_offset(&self, header_len: usize) -> u64 {
        let table = ((self.chunks.len() + 1) * CHUNK_TOC_ENTRY_SIZE) as u64;
        let payloads: u64 = self.chunks.iter().map(|&(_, len)| len).sum();
        header_len as u64 + table + payloads
    }

    /// Write the header and the complete lookup table (terminator included).
    pub fn begin(&mut self, header: &[u8]) -> Result<(), PackError> {
        assert!(!self.started, "begin called twice");
        self.started = true;

        self.out.write_all(header)?;

        let mut offset =
            header.len() as u64 + ((self.chunks.len() + 1) * CHUNK_TOC_ENTRY_SIZE) as u64;
        for &(id, len) in &self.chunks {
            self.out.write_all(&id.0)?;
            self.out.write_all(&offset.to_be_bytes())?;
            offset += len;
        }
        // Terminator: id 0, offset of the trailing hash.
        debug_assert_eq!(offset, self.trailer_offset(header.len()));
        self.out.write_all(&[0u8; 4])?;
        self.out.write_all(&offset.to_be_bytes())?;

        Ok(())
    }

    /// Stream the payload for the next declared chunk.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not the next declared chunk or if the payload
    /// length differs from the declaration; both are structural bugs.
    pub fn write_chunk<F>(&mut self, id: ChunkId, payload: F) -> Result<(), PackError>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        assert!(self.started, "write_chunk before begin");
        let (expected_id, expected_len) = *self
            .chunks
            .get(self.cursor)
            .unwrap_or_else(|| panic!("chunk {id} written but not declared"));
        assert_eq!(id, expected_id, "chunk {id} written out of order");

        let before = self.out.bytes_written();
        payload(&mut self.out)?;
        let actual = self.out.bytes_written() - before;
        assert_eq!(
            actual, expected_len,
            "chunk {id}: declared {expected_len} bytes, wrote {actual}"
        );

        self.cursor += 1;
        Ok(())
    }

    /// Append the trailing hash and flush. Returns the hash.
    pub fn finalize(self) -> Result<ObjectId, PackError> {
        assert!(self.started, "finalize before begin");
        assert_eq!(
            self.cursor,
            self.chunks.len(),
            "finalize with {} of {} chunks written",
            self.cursor,
            self.chunks.len()
        );

        let (mut inner, hash) = self.out.finish()?;
        inner.write_all(hash.as_bytes())?;
        inner.flush()?;
        Ok(hash)
    }
}

/// Parsed chunk lookup table of a mapped chunk file.
#[derive(Debug)]
pub struct ChunkTable {
    /// (id, byte range) per table entry, in file order. Unknown ids are
    /// kept so ranges stay contiguous; they are simply never requested.
    entries: Vec<(ChunkId, std::ops::Range<usize>)>,
}

impl ChunkTable {
    /// Walk the lookup table of a mapped file.
    ///
    /// `header_len` is where the table starts; `num_chunks` excludes the
    /// terminator; `hash_len` is the width of the trailing hash. Offsets
    /// must be strictly increasing, fit host addressing, and the
    /// terminator must carry id 0 with the trailing-hash position.
    pub fn parse(
        data: &[u8],
        header_len: usize,
        num_chunks: usize,
        hash_len: usize,
    ) -> Result<Self, PackError> {
        let table_end = header_len + (num_chunks + 1) * CHUNK_TOC_ENTRY_SIZE;
        if data.len() < table_end + hash_len {
            return Err(PackError::InvalidMidx("truncated chunk table".into()));
        }

        let mut raw: Vec<(ChunkId, usize)> = Vec::with_capacity(num_chunks + 1);
        for i in 0..=num_chunks {
            let pos = header_len + i * CHUNK_TOC_ENTRY_SIZE;
            let id = ChunkId([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            let offset = u64::from_be_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
                data[pos + 8],
                data[pos + 9],
                data[pos + 10],
                data[pos + 11],
            ]);
            let offset: usize = offset.try_into().map_err(|_| {
                PackError::InvalidMidx(format!("chunk offset {offset} overflows host addressing"))
            })?;
            raw.push((id, offset));
        }

        let terminator = raw[num_chunks];
        if terminator.0.as_u32() != 0 {
            return Err(PackError::InvalidMidx(format!(
                "chunk table terminator has id {}, expected 0",
                terminator.0
            )));
        }
        if terminator.1 != data.len() - hash_len {
            return Err(PackError::InvalidMidx(format!(
                "chunk table terminator offset {} does not match trailing hash position {}",
                terminator.1,
                data.len() - hash_len
            )));
        }

        let mut entries = Vec::with_capacity(num_chunks);
        for i in 0..num_chunks {
            let (id, start) = raw[i];
            let (_, end) = raw[i + 1];
            if id.as_u32() == 0 {
                return Err(PackError::InvalidMidx("chunk id 0 before terminator".into()));
            }
            if start < table_end || end <= start {
                return Err(PackError::InvalidMidx(format!(
                    "chunk {id} has out-of-order offsets {start}..{end}"
                )));
            }
            entries.push((id, start..end));
        }

        Ok(Self { entries })
    }

    /// Byte range of a chunk, if present.
    pub fn get(&self, id: ChunkId) -> Option<std::ops::Range<usize>> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, range)| range.clone())
    }

    /// Byte range of a required chunk.
    pub fn require(&self, id: ChunkId) -> Result<std::ops::Range<usize>, PackError> {
        self.get(id).ok_or(PackError::MissingChunk(id))
    }

    /// Number of chunks (terminator excluded).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
