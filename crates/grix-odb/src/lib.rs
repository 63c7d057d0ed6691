//! Minimal object store for the grix index subsystems.
//!
//! Reads and writes loose (zlib-compressed) objects and owns the
//! process-wide registry of open multi-pack indexes. The registry is state
//! of the store instance, not module state: additions go through `&mut
//! self` (serialized by the caller), lookups through `&self`.

mod loose;

use std::path::{Path, PathBuf};

use grix_hash::{HashAlgorithm, ObjectId};
use grix_object::Tree;
use grix_pack::midx::{Located, MultiPackIndex};

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum OdbError {
    #[error("corrupt loose object {oid}: {reason}")]
    Corrupt { oid: String, reason: String },

    #[error("decompression error for {oid}: {source}")]
    Decompress {
        oid: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object {0} is not a tree")]
    NotATree(ObjectId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] grix_object::ObjectError),

    #[error(transparent)]
    Pack(#[from] grix_pack::PackError),

    #[error(transparent)]
    Hash(#[from] grix_hash::HashError),

    #[error(transparent)]
    Util(#[from] grix_utils::UtilError),
}

/// Object store rooted at an `objects/` directory.
pub struct ObjectStore {
    objects_dir: PathBuf,
    hash_algo: HashAlgorithm,
    /// Open multi-pack indexes, newest first. Owned here; readers own
    /// their maps and pack handles and release them together on drop.
    midxs: Vec<MultiPackIndex>,
}

impl ObjectStore {
    /// Open the store at the given objects directory.
    pub fn open(objects_dir: impl AsRef<Path>) -> Self {
        Self::open_with_algo(objects_dir, HashAlgorithm::Sha1)
    }

    pub fn open_with_algo(objects_dir: impl AsRef<Path>, hash_algo: HashAlgorithm) -> Self {
        Self {
            objects_dir: objects_dir.as_ref().to_path_buf(),
            hash_algo,
            midxs: Vec::new(),
        }
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// The pack directory, `<objects>/pack`.
    pub fn pack_dir(&self) -> PathBuf {
        self.objects_dir.join("pack")
    }

    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }

    /// Scan the pack directory for `midx-*.midx` files and open them into
    /// the registry. Replaces the current registry contents; unreadable
    /// files are skipped. Returns how many indexes are registered.
    pub fn load_multi_pack_indexes(&mut self) -> Result<usize, OdbError> {
        self.midxs.clear();

        let pack_dir = self.pack_dir();
        if !pack_dir.is_dir() {
            return Ok(0);
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&pack_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                name.starts_with("midx-") && name.ends_with(".midx")
            })
            .collect();
        paths.sort();

        for path in paths {
            match MultiPackIndex::open(&path) {
                Ok(midx) => self.midxs.push(midx),
                // A damaged MIDX disables itself; other sources still work.
                Err(_) => continue,
            }
        }
        Ok(self.midxs.len())
    }

    /// Add an already-open multi-pack index to the registry.
    pub fn register_midx(&mut self, midx: MultiPackIndex) {
        self.midxs.push(midx);
    }

    /// Registered multi-pack indexes.
    pub fn midxs(&self) -> &[MultiPackIndex] {
        &self.midxs
    }

    /// Find a packed object through the registered multi-pack indexes.
    ///
    /// Walks the registry in order and returns the first hit whose pack is
    /// still present; stale hits fall through to the next source.
    pub fn locate_packed(&self, oid: &ObjectId) -> Option<Located> {
        self.midxs.iter().find_map(|midx| midx.locate(oid))
    }

    /// Read a tree object from the loose store.
    pub fn read_tree(&self, oid: &ObjectId) -> Result<Option<Tree>, OdbError> {
        match self.read_raw(oid)? {
            None => Ok(None),
            Some((grix_object::ObjectType::Tree, content)) => Ok(Some(Tree::parse(&content)?)),
            Some((_, _)) => Err(OdbError::NotATree(*oid)),
        }
    }
}
