//! Streaming hash computation and trailing-checksum helpers.
//!
//! Every index file in this workspace ends in a digest over all preceding
//! bytes. Builders stream through [`HashingWriter`] so the trailing digest
//! falls out of the write path; readers call [`verify_trailing`] to split
//! a mapped file into content and stored digest and compare the two.

use std::io::Write;

use crate::{HashAlgorithm, HashError, ObjectId};

/// One in-progress digest, algorithm-erased.
trait DigestState {
    fn absorb(&mut self, data: &[u8]);
    fn digest(self: Box<Self>) -> Result<ObjectId, HashError>;
}

impl DigestState for sha1_checked::Sha1 {
    fn absorb(&mut self, data: &[u8]) {
        use digest::Digest;
        self.update(data);
    }

    fn digest(self: Box<Self>) -> Result<ObjectId, HashError> {
        let outcome = self.try_finalize();
        if outcome.has_collision() {
            return Err(HashError::Sha1Collision);
        }
        ObjectId::from_bytes(outcome.hash().as_slice(), HashAlgorithm::Sha1)
    }
}

impl DigestState for sha2::Sha256 {
    fn absorb(&mut self, data: &[u8]) {
        use digest::Digest;
        self.update(data);
    }

    fn digest(self: Box<Self>) -> Result<ObjectId, HashError> {
        use digest::Digest;
        ObjectId::from_bytes((*self).finalize().as_slice(), HashAlgorithm::Sha256)
    }
}

/// Streaming hash computation over any supported algorithm.
///
/// SHA-1 runs with collision detection; a detected collision surfaces as
/// an error at finalization, never as a bogus identifier.
pub struct Hasher {
    state: Box<dyn DigestState>,
}

impl Hasher {
    /// Create a hasher for the given algorithm.
    pub fn new(algo: HashAlgorithm) -> Self {
        use digest::Digest;
        let state: Box<dyn DigestState> = match algo {
            HashAlgorithm::Sha1 => Box::new(sha1_checked::Sha1::new()),
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::new()),
        };
        Self { state }
    }

    /// Feed data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.state.absorb(data);
    }

    /// Finalize into an ObjectId.
    pub fn finalize(self) -> Result<ObjectId, HashError> {
        self.state.digest()
    }

    /// Hash a complete buffer in one call.
    pub fn digest(algo: HashAlgorithm, data: &[u8]) -> Result<ObjectId, HashError> {
        let mut hasher = Self::new(algo);
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash an object payload under its `"{type} {len}\0"` header.
    pub fn hash_object(
        algo: HashAlgorithm,
        obj_type: &str,
        data: &[u8],
    ) -> Result<ObjectId, HashError> {
        let mut hasher = Self::new(algo);
        hasher.update(format!("{} {}\0", obj_type, data.len()).as_bytes());
        hasher.update(data);
        hasher.finalize()
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Writer adapter that mirrors every byte into a rolling hasher.
///
/// Used by the chunk-file builder: the payload streams to the underlying
/// writer while the digest accumulates, so the trailing hash is available
/// at finish time without a second pass over the file.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, algo: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: Hasher::new(algo),
            written: 0,
        }
    }

    /// Total bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Stop hashing: returns the underlying writer and the digest of
    /// everything written through this adapter.
    pub fn finish(self) -> Result<(W, ObjectId), HashError> {
        let digest = self.hasher.finalize()?;
        Ok((self.inner, digest))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Check a file that ends in a digest over all preceding bytes.
///
/// Splits `data` into content and stored digest, recomputes, and returns
/// the stored digest on agreement. Disagreement (and a buffer too short
/// to hold a digest at all) is an error.
pub fn verify_trailing(data: &[u8], algo: HashAlgorithm) -> Result<ObjectId, HashError> {
    let hash_len = algo.digest_len();
    if data.len() < hash_len {
        return Err(HashError::InvalidHashLength {
            expected: hash_len,
            actual: data.len(),
        });
    }
    let (content, trailer) = data.split_at(data.len() - hash_len);
    let stored = ObjectId::from_bytes(trailer, algo)?;
    let computed = Hasher::digest(algo, content)?;
    if computed != stored {
        return Err(HashError::ChecksumMismatch { stored, computed });
    }
    Ok(stored)
}
