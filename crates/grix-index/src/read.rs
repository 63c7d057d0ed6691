//! Index file reading (v2/v3).

use bstr::BString;
use grix_hash::{HashAlgorithm, ObjectId};
use grix_object::FileMode;

use crate::entry::{EntryFlags, IndexEntry, StatData};
use crate::tree::CacheTree;
use crate::write::{EXT_SPARSE_DIR, INDEX_SIGNATURE};
use crate::{Index, IndexError, RawExtension, Stage};

/// Parse an index file from raw bytes.
pub fn parse_index(data: &[u8]) -> Result<Index, IndexError> {
    if data.len() < 12 + 20 {
        return Err(IndexError::InvalidHeader("index file too short".into()));
    }
    verify_checksum(data)?;

    let mut cursor = 0;
    if &data[0..4] != INDEX_SIGNATURE {
        return Err(IndexError::InvalidHeader(format!(
            "bad signature: {:?}",
            &data[0..4]
        )));
    }
    cursor += 4;

    let version = read_u32(&data[cursor..]);
    cursor += 4;
    if !(2..=3).contains(&version) {
        return Err(IndexError::UnsupportedVersion(version));
    }

    let entry_count = read_u32(&data[cursor..]) as usize;
    cursor += 4;

    let content_end = data.len() - 20;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let (entry, next) = parse_entry(data, cursor, version, content_end)?;
        if let Some(prev) = entries.last() {
            if crate::cmp_entries(prev, &entry) != std::cmp::Ordering::Less {
                return Err(IndexError::InvalidEntry {
                    offset: cursor,
                    reason: format!("entry '{}' out of order", entry.path),
                });
            }
        }
        entries.push(entry);
        cursor = next;
    }

    let mut index = Index::new();
    index.set_version(version);
    // Entries were validated sorted; install them wholesale so the cache
    // tree parsed below is not invalidated entry by entry.
    index.replace_entries(entries);

    let mut sparse_marker = false;
    while cursor + 8 <= content_end {
        let sig = [data[cursor], data[cursor + 1], data[cursor + 2], data[cursor + 3]];
        let ext_size = read_u32(&data[cursor + 4..]) as usize;
        cursor += 8;

        if cursor + ext_size > content_end {
            return Err(IndexError::InvalidExtension {
                sig: String::from_utf8_lossy(&sig).into_owned(),
                reason: "extension data exceeds index bounds".into(),
            });
        }
        let ext_data = &data[cursor..cursor + ext_size];
        cursor += ext_size;

        match &sig {
            CacheTree::SIGNATURE => {
                index.set_cache_tree(Some(CacheTree::parse(ext_data)?));
            }
            EXT_SPARSE_DIR => {
                sparse_marker = true;
            }
            _ => {
                // Extensions starting with a lowercase letter must be
                // understood; the rest are optional and preserved.
                if sig[0].is_ascii_lowercase() {
                    return Err(IndexError::UnknownRequiredExtension {
                        sig: String::from_utf8_lossy(&sig).into_owned(),
                    });
                }
                index.push_unknown_extension(RawExtension {
                    signature: sig,
                    data: ext_data.to_vec(),
                });
            }
        }
    }

    if sparse_marker && !index.has_sparse_dirs() {
        return Err(IndexError::InvalidExtension {
            sig: "sdir".into(),
            reason: "sparse marker present but no sparse-directory entries".into(),
        });
    }
    if !sparse_marker && index.has_sparse_dirs() {
        return Err(IndexError::InvalidHeader(
            "sparse-directory entries without the sparse marker extension".into(),
        ));
    }

    Ok(index)
}

/// On-disk fixed prefix of an entry: ctime(8) mtime(8) dev(4) ino(4)
/// mode(4) uid(4) gid(4) size(4).
const ENTRY_FIXED_SIZE: usize = 40;

/// Entry size with padding: the C formula `(fixed + oid + flags + name + 8) & ~7`.
fn ondisk_entry_size(name_len: usize, extended: bool) -> usize {
    let flags_size = if extended { 4 } else { 2 };
    (ENTRY_FIXED_SIZE + 20 + flags_size + name_len + 8) & !7
}

fn parse_entry(
    data: &[u8],
    start: usize,
    version: u32,
    content_end: usize,
) -> Result<(IndexEntry, usize), IndexError> {
    let mut cursor = start;
    if cursor + ENTRY_FIXED_SIZE + 20 + 2 > content_end {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: "entry too short".into(),
        });
    }

    let stat = StatData {
        ctime_secs: read_u32(&data[cursor..]),
        ctime_nsecs: read_u32(&data[cursor + 4..]),
        mtime_secs: read_u32(&data[cursor + 8..]),
        mtime_nsecs: read_u32(&data[cursor + 12..]),
        dev: read_u32(&data[cursor + 16..]),
        ino: read_u32(&data[cursor + 20..]),
        uid: read_u32(&data[cursor + 28..]),
        gid: read_u32(&data[cursor + 32..]),
        size: read_u32(&data[cursor + 36..]),
    };
    let mode_raw = read_u32(&data[cursor + 24..]);
    cursor += ENTRY_FIXED_SIZE;

    let oid = ObjectId::from_bytes(&data[cursor..cursor + 20], HashAlgorithm::Sha1)
        .map_err(|_| IndexError::InvalidEntry {
            offset: start,
            reason: "invalid OID".into(),
        })?;
    cursor += 20;

    let flags_raw = read_u16(&data[cursor..]);
    cursor += 2;

    let assume_valid = flags_raw & 0x8000 != 0;
    let extended = flags_raw & 0x4000 != 0;
    let stage = Stage::from_u8(((flags_raw >> 12) & 0x3) as u8)?;

    let mut intent_to_add = false;
    let mut skip_worktree = false;
    if extended {
        if version < 3 {
            return Err(IndexError::InvalidEntry {
                offset: start,
                reason: "extended flags in a v2 index".into(),
            });
        }
        if cursor + 2 > content_end {
            return Err(IndexError::InvalidEntry {
                offset: start,
                reason: "truncated extended flags".into(),
            });
        }
        let ext_flags = read_u16(&data[cursor..]);
        cursor += 2;
        skip_worktree = ext_flags & 0x4000 != 0;
        intent_to_add = ext_flags & 0x2000 != 0;
    }

    let nul_pos = data[cursor..content_end]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IndexError::InvalidEntry {
            offset: start,
            reason: "missing NUL in path".into(),
        })?;
    let path = BString::from(&data[cursor..cursor + nul_pos]);

    let next = start + ondisk_entry_size(nul_pos, extended);
    if next > content_end {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: "entry padding exceeds index bounds".into(),
        });
    }

    Ok((
        IndexEntry {
            path,
            oid,
            mode: FileMode::from_raw(mode_raw),
            stage,
            stat,
            flags: EntryFlags {
                assume_valid,
                intent_to_add,
                skip_worktree,
            },
        },
        next,
    ))
}

fn verify_checksum(data: &[u8]) -> Result<(), IndexError> {
    grix_hash::hasher::verify_trailing(data, HashAlgorithm::Sha1)
        .map(|_| ())
        .map_err(|_| IndexError::ChecksumMismatch)
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}
