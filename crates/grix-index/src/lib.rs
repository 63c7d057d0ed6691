//! Working-tree index with sparse-index support.
//!
//! The index is a path-sorted array of entries between the working tree
//! and the object store. This crate covers reading and writing it, the
//! cache-tree extension used to navigate contiguous subtree spans, and the
//! sparse-index transformation: collapsing subtrees outside the sparse
//! cone into single directory entries and re-expanding them on demand.

pub mod contract;
pub mod entry;
pub mod expand;
pub mod sparse;
pub mod tree;

mod read;
mod write;

use std::path::Path;

use bstr::{BStr, ByteSlice};
use grix_hash::ObjectId;

pub use contract::{convert_to_sparse, ConvertOutcome, SparseIndexSettings};
pub use entry::{EntryFlags, IndexEntry, StatData};
pub use expand::{ensure_full_index, expand_to_path};
pub use sparse::SparseCheckout;
pub use tree::{CacheTree, CacheTreeNode};

/// Errors from index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid index header: {0}")]
    InvalidHeader(String),

    #[error("unsupported index version: {0}")]
    UnsupportedVersion(u32),

    #[error("index checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid index entry at offset {offset}: {reason}")]
    InvalidEntry { offset: usize, reason: String },

    #[error("invalid extension '{sig}': {reason}")]
    InvalidExtension { sig: String, reason: String },

    #[error("unknown required extension '{sig}'")]
    UnknownRequiredExtension { sig: String },

    #[error("cache tree cannot be built: {0}")]
    CacheTree(String),

    #[error("sparse index requires cone-mode sparse-checkout patterns")]
    SparseWithoutCone,

    #[error("tree object {0} not found while expanding a sparse directory")]
    MissingTree(ObjectId),

    #[error("lock failed: {path}")]
    LockFailed { path: std::path::PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Odb(#[from] grix_odb::OdbError),

    #[error(transparent)]
    Object(#[from] grix_object::ObjectError),
}

/// Merge stage of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stage {
    /// Normal entry (stage 0).
    #[default]
    Normal,
    /// Common ancestor in a conflict (stage 1).
    Base,
    /// Our side of a conflict (stage 2).
    Ours,
    /// Their side of a conflict (stage 3).
    Theirs,
}

impl Stage {
    pub fn as_u8(&self) -> u8 {
        match self {
            Stage::Normal => 0,
            Stage::Base => 1,
            Stage::Ours => 2,
            Stage::Theirs => 3,
        }
    }

    pub fn from_u8(n: u8) -> Result<Self, IndexError> {
        match n {
            0 => Ok(Stage::Normal),
            1 => Ok(Stage::Base),
            2 => Ok(Stage::Ours),
            3 => Ok(Stage::Theirs),
            _ => Err(IndexError::InvalidEntry {
                offset: 0,
                reason: format!("invalid stage: {n}"),
            }),
        }
    }
}

/// An index extension preserved without interpretation.
#[derive(Debug, Clone)]
pub struct RawExtension {
    pub signature: [u8; 4],
    pub data: Vec<u8>,
}

/// The working-tree index.
///
/// Entries stay sorted by (path, stage). `sparse` is true exactly when at
/// least one sparse-directory entry is present; the writer re-derives the
/// on-disk marker from the entries, so the flag cannot drift from the
/// contents across a round-trip.
#[derive(Debug)]
pub struct Index {
    /// Index format version (2 or 3).
    version: u32,
    /// Entries sorted by (path, stage).
    entries: Vec<IndexEntry>,
    /// Cache tree extension, when valid for the current entries.
    cache_tree: Option<CacheTree>,
    /// Optional extensions we do not interpret, preserved for round-trip.
    unknown_extensions: Vec<RawExtension>,
    /// Whether the index contains sparse-directory entries.
    sparse: bool,
    /// Whether a split index is in use (set by the owning repository;
    /// blocks sparse contraction).
    split_index: bool,
    /// Filesystem-monitor token; its path domain matches the current
    /// entry layout and is dropped when the layout changes shape.
    fsmonitor_token: Option<String>,
    /// Reentrancy guard for the sparse expander.
    pub(crate) expanding: bool,
}

impl Index {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self {
            version: 2,
            entries: Vec::new(),
            cache_tree: None,
            unknown_extensions: Vec::new(),
            sparse: false,
            split_index: false,
            fsmonitor_token: None,
            expanding: false,
        }
    }

    /// Read the index from a file (memory-mapped).
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let file = std::fs::File::open(path.as_ref())?;
        let data = unsafe { memmap2::Mmap::map(&file) }?;
        read::parse_index(&data)
    }

    /// Write the index to a file atomically via a lock file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        write::write_index(self, path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Entries in (path, stage) order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Entry with the exact path (any stage).
    pub fn find(&self, path: &BStr) -> Option<&IndexEntry> {
        let pos = self
            .entries
            .partition_point(|e| e.path.as_bstr() < path);
        self.entries.get(pos).filter(|e| e.path.as_bstr() == path)
    }

    /// Entry with the exact path and stage.
    pub fn get(&self, path: &BStr, stage: Stage) -> Option<&IndexEntry> {
        let mut pos = self
            .entries
            .partition_point(|e| e.path.as_bstr() < path);
        while let Some(entry) = self.entries.get(pos) {
            if entry.path.as_bstr() != path {
                return None;
            }
            if entry.stage == stage {
                return Some(entry);
            }
            pos += 1;
        }
        None
    }

    /// Add or replace an entry, keeping sorted order.
    pub fn add(&mut self, entry: IndexEntry) {
        if let Some(ref mut tree) = self.cache_tree {
            tree.invalidate(entry.path.as_bstr());
        }
        match self
            .entries
            .binary_search_by(|e| cmp_entries(e, &entry))
        {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
        self.refresh_sparse_flag();
    }

    /// Remove entries matching path and stage. Returns true if any went.
    pub fn remove(&mut self, path: &BStr, stage: Stage) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.path.as_bstr() == path && e.stage == stage));
        let removed = self.entries.len() < before;
        if removed {
            if let Some(ref mut tree) = self.cache_tree {
                tree.invalidate(path);
            }
            self.refresh_sparse_flag();
        }
        removed
    }

    /// Whether any entry of `path` carries a conflict stage.
    pub fn has_conflicts(&self, path: &BStr) -> bool {
        self.entries
            .iter()
            .any(|e| e.path.as_bstr() == path && e.stage != Stage::Normal)
    }

    /// Whether the index is in the sparse representation.
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// Whether any sparse-directory entry is present.
    pub fn has_sparse_dirs(&self) -> bool {
        self.entries.iter().any(IndexEntry::is_sparse_dir)
    }

    pub fn cache_tree(&self) -> Option<&CacheTree> {
        self.cache_tree.as_ref()
    }

    pub fn set_cache_tree(&mut self, tree: Option<CacheTree>) {
        self.cache_tree = tree;
    }

    pub fn split_index(&self) -> bool {
        self.split_index
    }

    /// Mark the index as backed by a split index (owned by the repository
    /// layer; the sparse contractor refuses to run on one).
    pub fn set_split_index(&mut self, split: bool) {
        self.split_index = split;
    }

    pub fn fsmonitor_token(&self) -> Option<&str> {
        self.fsmonitor_token.as_deref()
    }

    pub fn set_fsmonitor_token(&mut self, token: Option<String>) {
        self.fsmonitor_token = token;
    }

    /// Swap in a replacement entry array. The old array (and its entries)
    /// is dropped only after the new one is in place.
    pub(crate) fn replace_entries(&mut self, entries: Vec<IndexEntry>) {
        self.entries = entries;
        self.refresh_sparse_flag();
    }

    /// Keep the sparse flag equal to "contains a sparse-directory entry".
    pub(crate) fn refresh_sparse_flag(&mut self) {
        self.sparse = self.has_sparse_dirs();
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub(crate) fn unknown_extensions(&self) -> &[RawExtension] {
        &self.unknown_extensions
    }

    pub(crate) fn push_unknown_extension(&mut self, ext: RawExtension) {
        self.unknown_extensions.push(ext);
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort order of the entry array: path, then stage.
pub(crate) fn cmp_entries(a: &IndexEntry, b: &IndexEntry) -> std::cmp::Ordering {
    a.path
        .cmp(&b.path)
        .then(a.stage.as_u8().cmp(&b.stage.as_u8()))
}
