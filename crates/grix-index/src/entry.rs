//! Index entry types.

use bstr::{BString, ByteSlice};
use grix_hash::ObjectId;
use grix_object::FileMode;

use crate::Stage;

/// A single index entry.
///
/// Regular entries and sparse-directory entries share this shape; the
/// discriminator is structural (a tree mode plus a trailing `/` in the
/// path), not a separate type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the repository root; the sort key.
    pub path: BString,
    /// Blob OID, or tree OID for a sparse-directory entry.
    pub oid: ObjectId,
    /// File mode.
    pub mode: FileMode,
    /// Merge stage.
    pub stage: Stage,
    /// Cached filesystem stat data.
    pub stat: StatData,
    /// Entry flags.
    pub flags: EntryFlags,
}

impl IndexEntry {
    /// Build a sparse-directory entry standing in for every file under
    /// `path`. `path` must end in `/`; `oid` names the subtree's tree
    /// object. The skip-worktree bit is set, as the representation
    /// requires.
    pub fn sparse_dir(path: BString, oid: ObjectId) -> Self {
        debug_assert!(path.last() == Some(&b'/'), "sparse dir path must end in '/'");
        Self {
            path,
            oid,
            mode: FileMode::TREE,
            stage: Stage::Normal,
            stat: StatData::default(),
            flags: EntryFlags {
                skip_worktree: true,
                ..EntryFlags::default()
            },
        }
    }

    /// Whether this entry is a sparse-directory placeholder.
    pub fn is_sparse_dir(&self) -> bool {
        self.mode.is_tree() && self.path.last_byte() == Some(b'/')
    }
}

/// Filesystem stat data cached per entry for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatData {
    pub ctime_secs: u32,
    pub ctime_nsecs: u32,
    pub mtime_secs: u32,
    pub mtime_nsecs: u32,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
}

/// Per-entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags {
    /// CE_VALID: assume the entry is unchanged.
    pub assume_valid: bool,
    /// CE_INTENT_TO_ADD: placeholder entry without content.
    pub intent_to_add: bool,
    /// CE_SKIP_WORKTREE: tracked, but not materialized in the worktree.
    pub skip_worktree: bool,
}

impl EntryFlags {
    /// Whether any extended (v3) flags are set.
    pub fn has_extended(&self) -> bool {
        self.intent_to_add || self.skip_worktree
    }
}
