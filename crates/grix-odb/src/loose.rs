//! Loose object read/write.
//!
//! Each loose object lives at `<objects>/XX/YYYY...` (first hex byte, then
//! the rest) as zlib-compressed `"<type> <size>\0<content>"`. Writes are
//! idempotent and atomic: compress into a temp file beside the target,
//! then rename.

use std::fs;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use grix_hash::hasher::Hasher;
use grix_hash::ObjectId;
use grix_object::{ObjectHeader, ObjectType};
use grix_utils::tempfile::TempFile;

use crate::{ObjectStore, OdbError};

impl ObjectStore {
    /// Path of the loose object file for `oid`.
    pub fn loose_path(&self, oid: &ObjectId) -> std::path::PathBuf {
        self.objects_dir().join(oid.loose_path())
    }

    /// Whether a loose object exists.
    pub fn contains_loose(&self, oid: &ObjectId) -> bool {
        self.loose_path(oid).is_file()
    }

    /// Read a loose object. `Ok(None)` when absent, `Err` when corrupt.
    pub fn read_raw(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, OdbError> {
        let path = self.loose_path(oid);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(OdbError::Io(e)),
        };

        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw).map_err(|e| OdbError::Decompress {
            oid: oid.to_hex(),
            source: e,
        })?;

        let header = ObjectHeader::decode(&raw)?;
        let content = &raw[header.header_len..];
        if content.len() != header.content_len {
            return Err(OdbError::Corrupt {
                oid: oid.to_hex(),
                reason: format!(
                    "declared {} content bytes, found {}",
                    header.content_len,
                    content.len()
                ),
            });
        }
        Ok(Some((header.kind, content.to_vec())))
    }

    /// Write raw content with a known type. Returns the OID.
    ///
    /// A no-op when the object already exists (content addressing makes
    /// re-writes idempotent).
    pub fn write_raw(&self, obj_type: ObjectType, content: &[u8]) -> Result<ObjectId, OdbError> {
        let hdr = ObjectHeader::encode(obj_type, content.len());

        let oid = {
            let mut hasher = Hasher::new(self.hash_algo());
            hasher.update(&hdr);
            hasher.update(content);
            hasher.finalize()?
        };

        if self.contains_loose(&oid) {
            return Ok(oid);
        }

        let final_path = self.loose_path(&oid);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = TempFile::new_for(&final_path)?;
        {
            let mut encoder = ZlibEncoder::new(&mut tmp, Compression::default());
            encoder.write_all(&hdr)?;
            encoder.write_all(content)?;
            encoder.finish()?;
        }
        tmp.persist(&final_path)?;

        Ok(oid)
    }
}
