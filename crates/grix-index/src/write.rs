//! Index file writing.

use std::io::Write;
use std::path::Path;

use grix_hash::hasher::Hasher;
use grix_hash::HashAlgorithm;
use grix_utils::lockfile::LockFile;

use crate::entry::IndexEntry;
use crate::tree::CacheTree;
use crate::{Index, IndexError};

/// Magic bytes at the start of every index file.
pub(crate) const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";

/// Required extension marking a sparse index. The lowercase first byte
/// makes readers that do not understand sparse directories reject the
/// file instead of misreading it.
pub(crate) const EXT_SPARSE_DIR: &[u8; 4] = b"sdir";

/// Write the index atomically through a scoped lock: serialize, fill the
/// lock file, and commit, rolling back on any failure.
pub fn write_index(index: &Index, path: &Path) -> Result<(), IndexError> {
    let data = serialize_index(index)?;
    LockFile::update(path, |lock| lock.write_all(&data)).map_err(|_| {
        IndexError::LockFailed {
            path: path.to_path_buf(),
        }
    })
}

/// Serialize the index to bytes.
///
/// The version is chosen from the content: v3 when any entry needs
/// extended flags, v2 otherwise. The sparse marker extension is derived
/// from the entries, so the on-disk flag can never disagree with them.
fn serialize_index(index: &Index) -> Result<Vec<u8>, IndexError> {
    let version = if index.iter().any(|e| e.flags.has_extended()) {
        3
    } else {
        2
    };

    let mut buf = Vec::new();
    buf.extend_from_slice(INDEX_SIGNATURE);
    buf.extend_from_slice(&(version as u32).to_be_bytes());
    buf.extend_from_slice(&(index.len() as u32).to_be_bytes());

    for entry in index.iter() {
        write_entry(&mut buf, entry, version);
    }

    if let Some(tree) = index.cache_tree() {
        let payload = tree.serialize();
        buf.extend_from_slice(CacheTree::SIGNATURE);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
    }

    if index.has_sparse_dirs() {
        buf.extend_from_slice(EXT_SPARSE_DIR);
        buf.extend_from_slice(&0u32.to_be_bytes());
    }

    for ext in index.unknown_extensions() {
        buf.extend_from_slice(&ext.signature);
        buf.extend_from_slice(&(ext.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&ext.data);
    }

    let checksum = Hasher::digest(HashAlgorithm::Sha1, &buf)
        .map_err(|_| IndexError::InvalidHeader("checksum computation failed".into()))?;
    buf.extend_from_slice(checksum.as_bytes());
    Ok(buf)
}

fn write_entry(buf: &mut Vec<u8>, entry: &IndexEntry, version: u32) {
    let entry_start = buf.len();

    buf.extend_from_slice(&entry.stat.ctime_secs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.ctime_nsecs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.mtime_secs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.mtime_nsecs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.dev.to_be_bytes());
    buf.extend_from_slice(&entry.stat.ino.to_be_bytes());
    buf.extend_from_slice(&entry.mode.raw().to_be_bytes());
    buf.extend_from_slice(&entry.stat.uid.to_be_bytes());
    buf.extend_from_slice(&entry.stat.gid.to_be_bytes());
    buf.extend_from_slice(&entry.stat.size.to_be_bytes());
    buf.extend_from_slice(entry.oid.as_bytes());

    let extended = entry.flags.has_extended();
    debug_assert!(!extended || version >= 3, "extended flags need v3");

    let name_len = entry.path.len().min(0xfff) as u16;
    let mut flags: u16 = name_len;
    flags |= (entry.stage.as_u8() as u16) << 12;
    if entry.flags.assume_valid {
        flags |= 0x8000;
    }
    if extended {
        flags |= 0x4000;
    }
    buf.extend_from_slice(&flags.to_be_bytes());

    if extended {
        let mut ext_flags: u16 = 0;
        if entry.flags.skip_worktree {
            ext_flags |= 0x4000;
        }
        if entry.flags.intent_to_add {
            ext_flags |= 0x2000;
        }
        buf.extend_from_slice(&ext_flags.to_be_bytes());
    }

    buf.extend_from_slice(&entry.path);

    // Pad with NULs to the C entry-size formula.
    let flags_size = if extended { 4 } else { 2 };
    let entry_size = (40 + 20 + flags_size + entry.path.len() + 8) & !7;
    buf.resize(entry_start + entry_size, 0);
}
