//! Sparse-index expansion: sparse index → full index.

use bstr::{BStr, BString, ByteSlice};
use grix_hash::ObjectId;
use grix_object::{ObjectType, TreeIter};
use grix_odb::{ObjectStore, OdbError};

use crate::{EntryFlags, Index, IndexEntry, IndexError, Stage, StatData};

/// Expand every sparse-directory entry back into its file entries.
///
/// Regular entries are kept verbatim; each sparse directory is replaced by
/// the blobs of its tree, read recursively, every one carrying the
/// skip-worktree bit. The replacement array is swapped in whole and the
/// sparse flag cleared. A sparse-directory entry missing the skip-worktree
/// bit is inconsistent data: it is warned about and expanded anyway, never
/// silently repaired.
pub fn ensure_full_index(index: &mut Index, store: &ObjectStore) -> Result<(), IndexError> {
    if !index.is_sparse() || index.expanding {
        return Ok(());
    }

    // The tree reads below go through machinery that may consult the
    // index again; the guard keeps a nested targeted expand from
    // recursing.
    index.expanding = true;
    let result = expand_all(index, store);
    index.expanding = false;
    result
}

fn expand_all(index: &mut Index, store: &ObjectStore) -> Result<(), IndexError> {
    let mut full: Vec<IndexEntry> = Vec::with_capacity(index.len() * 3 / 2);

    for entry in index.entries() {
        if !entry.is_sparse_dir() {
            full.push(entry.clone());
            continue;
        }
        if !entry.flags.skip_worktree {
            eprintln!(
                "warning: sparse-directory entry '{}' is missing the skip-worktree bit",
                entry.path
            );
        }
        expand_tree_into(store, &entry.oid, entry.path.as_bstr(), &mut full)?;
    }

    index.replace_entries(full);
    // Spans moved; the cache tree must be rebuilt before the next save.
    index.set_cache_tree(None);
    Ok(())
}

/// Emit index entries for every blob under the tree `oid`.
///
/// `dir_path` ends in `/`. The tree's raw bytes are streamed through
/// [`TreeIter`] in canonical tree order, which coincides with index path
/// order once directory names get their trailing slash, so appending
/// keeps the array sorted.
fn expand_tree_into(
    store: &ObjectStore,
    oid: &ObjectId,
    dir_path: &BStr,
    out: &mut Vec<IndexEntry>,
) -> Result<(), IndexError> {
    let (kind, content) = store
        .read_raw(oid)?
        .ok_or(IndexError::MissingTree(*oid))?;
    if kind != ObjectType::Tree {
        return Err(IndexError::Odb(OdbError::NotATree(*oid)));
    }

    for item in TreeIter::new(&content) {
        let item = item?;
        let mut path = BString::from(dir_path.as_bytes());
        path.extend_from_slice(&item.name);

        if item.mode.is_tree() {
            path.push(b'/');
            expand_tree_into(store, &item.oid, path.as_bstr(), out)?;
        } else {
            out.push(IndexEntry {
                path,
                oid: item.oid,
                mode: item.mode,
                stage: Stage::Normal,
                stat: StatData::default(),
                flags: EntryFlags {
                    skip_worktree: true,
                    ..EntryFlags::default()
                },
            });
        }
    }
    Ok(())
}

/// Make `path` present as an ordinary entry, expanding the index if a
/// sparse-directory entry covers it.
///
/// No-op when the path is already present, when no sparse directory
/// covers it, or when called reentrantly from inside another expansion.
pub fn expand_to_path(
    index: &mut Index,
    store: &ObjectStore,
    path: &BStr,
) -> Result<(), IndexError> {
    if index.expanding || !index.is_sparse() {
        return Ok(());
    }
    if index.find(path).is_some() {
        return Ok(());
    }

    if sparse_dir_covering(index, path).is_some() {
        return ensure_full_index(index, store);
    }
    Ok(())
}

/// Find the sparse-directory entry covering `path`, if any.
///
/// Works off the sorted entry array: a covering directory `d/` sorts
/// immediately before every path under it, so probing the insertion
/// position of `path` and looking at the adjacent entry suffices. The
/// probe also catches `path` itself being recorded as `path/`.
fn sparse_dir_covering<'a>(index: &'a Index, path: &BStr) -> Option<&'a IndexEntry> {
    // `path/` present as a sparse directory?
    let mut with_slash = BString::from(path.as_bytes());
    with_slash.push(b'/');
    if let Some(entry) = index.find(with_slash.as_bstr()) {
        if entry.is_sparse_dir() {
            return Some(entry);
        }
    }

    let entries = index.entries();
    let pos = entries.partition_point(|e| e.path.as_bstr() < path);
    let candidate = entries.get(pos.checked_sub(1)?)?;
    if candidate.is_sparse_dir() && path.starts_with(&candidate.path[..]) {
        Some(candidate)
    } else {
        None
    }
}
