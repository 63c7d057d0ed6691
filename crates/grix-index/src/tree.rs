//! Cache tree extension (TREE) and span navigation.
//!
//! The cache tree is a hierarchical summary of the entry array: each node
//! covers a contiguous span of path-sorted entries sharing a directory
//! prefix and, when valid, records the OID of the tree object for that
//! subtree. The sparse contractor walks it to find collapsible spans; the
//! serialized form rides in the index's `TREE` extension.

use bstr::{BStr, BString, ByteSlice};
use grix_hash::{HashAlgorithm, ObjectId};
use grix_object::{FileMode, ObjectType, Tree, TreeEntry};
use grix_odb::ObjectStore;

use crate::{Index, IndexError, Stage};

/// Cache tree: cached tree OIDs aligned with the entry array.
#[derive(Debug, Clone)]
pub struct CacheTree {
    pub root: CacheTreeNode,
}

/// One node of the cache tree.
///
/// `entry_count < 0` marks an invalidated node whose OID is unknown.
/// Children are kept sorted by name so subdirectory lookup can binary
/// search. The children's spans plus the node's direct file entries tile
/// the node's span contiguously, in entry-array order.
#[derive(Debug, Clone)]
pub struct CacheTreeNode {
    /// Subtree name (empty for the root).
    pub name: BString,
    /// Number of covered index entries, or -1 when invalid.
    pub entry_count: i32,
    /// Tree OID; present only while the node is valid.
    pub oid: Option<ObjectId>,
    /// Subdirectory nodes, sorted by name.
    pub children: Vec<CacheTreeNode>,
}

impl CacheTreeNode {
    /// Whether this node carries a usable span and OID.
    pub fn is_valid(&self) -> bool {
        self.entry_count >= 0 && self.oid.is_some()
    }

    /// Covered span width, when valid.
    pub fn span_len(&self) -> Option<usize> {
        (self.entry_count >= 0).then_some(self.entry_count as usize)
    }

    /// Binary-search a subdirectory by name.
    pub fn child(&self, name: &BStr) -> Option<&CacheTreeNode> {
        self.children
            .binary_search_by(|c| c.name.as_bstr().cmp(name))
            .ok()
            .map(|i| &self.children[i])
    }
}

impl CacheTree {
    /// Extension signature in the index file.
    pub const SIGNATURE: &'static [u8; 4] = b"TREE";

    /// Build a fully valid cache tree for a *full* index, writing the tree
    /// objects for every subtree through the store.
    ///
    /// Fails on unmerged entries (conflicted paths have no tree
    /// representation) and on an index that already contains
    /// sparse-directory entries.
    pub fn from_index(index: &Index, store: &ObjectStore) -> Result<Self, IndexError> {
        let entries = index.entries();
        if entries.iter().any(|e| e.stage != Stage::Normal) {
            return Err(IndexError::CacheTree("unmerged entries in index".into()));
        }
        if entries.iter().any(|e| e.is_sparse_dir()) {
            return Err(IndexError::CacheTree(
                "index already contains sparse-directory entries".into(),
            ));
        }

        let (root, consumed) = build_node(entries, 0, b"", b"", store)?;
        debug_assert_eq!(consumed, entries.len());
        Ok(Self { root })
    }

    /// Parse a TREE extension payload.
    pub fn parse(data: &[u8]) -> Result<Self, IndexError> {
        let mut cursor = 0;
        // The root's name is the empty string, so the payload starts with
        // its NUL terminator.
        if data.first() == Some(&0) {
            cursor += 1;
        }
        let root = parse_node(data, &mut cursor, b"")?;
        Ok(Self { root })
    }

    /// Serialize to the TREE extension payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        serialize_node(&self.root, &mut buf, true);
        buf
    }

    /// Invalidate the node covering `path` and every ancestor.
    pub fn invalidate(&mut self, path: &BStr) {
        invalidate_node(&mut self.root, path.as_bytes());
    }

    /// The root tree OID, when the whole tree is valid.
    pub fn root_oid(&self) -> Option<&ObjectId> {
        if self.root.entry_count >= 0 {
            self.root.oid.as_ref()
        } else {
            None
        }
    }
}

/// Recursively build the node covering the span starting at `start`,
/// writing each subtree's tree object and returning the span width.
fn build_node(
    entries: &[crate::IndexEntry],
    start: usize,
    prefix: &[u8],
    name: &[u8],
    store: &ObjectStore,
) -> Result<(CacheTreeNode, usize), IndexError> {
    let mut tree_entries: Vec<TreeEntry> = Vec::new();
    let mut children: Vec<CacheTreeNode> = Vec::new();
    let mut pos = start;

    while pos < entries.len() && entries[pos].path.starts_with(prefix) {
        let rel = &entries[pos].path[prefix.len()..];
        if let Some(slash) = rel.find_byte(b'/') {
            let dir_name = rel[..slash].to_vec();
            let mut child_prefix = Vec::with_capacity(prefix.len() + dir_name.len() + 1);
            child_prefix.extend_from_slice(prefix);
            child_prefix.extend_from_slice(&dir_name);
            child_prefix.push(b'/');

            let (child, count) = build_node(entries, pos, &child_prefix, &dir_name, store)?;
            let child_oid = child.oid.expect("freshly built nodes are valid");
            tree_entries.push(TreeEntry {
                mode: FileMode::TREE,
                name: dir_name.into(),
                oid: child_oid,
            });
            children.push(child);
            pos += count;
        } else {
            let entry = &entries[pos];
            tree_entries.push(TreeEntry {
                mode: entry.mode,
                name: rel.into(),
                oid: entry.oid,
            });
            pos += 1;
        }
    }

    let tree = Tree {
        entries: tree_entries,
    };
    let oid = store.write_raw(ObjectType::Tree, &tree.serialize_content())?;

    children.sort_by(|a, b| a.name.cmp(&b.name));
    let count = pos - start;
    Ok((
        CacheTreeNode {
            name: name.into(),
            entry_count: count as i32,
            oid: Some(oid),
            children,
        },
        count,
    ))
}

fn parse_node(data: &[u8], cursor: &mut usize, name: &[u8]) -> Result<CacheTreeNode, IndexError> {
    let entry_count = parse_ascii_int(data, cursor, b' ')?;
    let subtree_count = parse_ascii_int(data, cursor, b'\n')?;
    if subtree_count < 0 {
        return Err(invalid_tree("negative subtree count"));
    }

    let oid = if entry_count >= 0 {
        let hash_len = HashAlgorithm::Sha1.digest_len();
        if *cursor + hash_len > data.len() {
            return Err(invalid_tree("truncated OID"));
        }
        let oid = ObjectId::from_bytes(&data[*cursor..*cursor + hash_len], HashAlgorithm::Sha1)
            .map_err(|_| invalid_tree("invalid OID"))?;
        *cursor += hash_len;
        Some(oid)
    } else {
        None
    };

    let mut children = Vec::with_capacity(subtree_count as usize);
    for _ in 0..subtree_count {
        let name_end = data[*cursor..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| invalid_tree("missing child name terminator"))?
            + *cursor;
        let child_name = data[*cursor..name_end].to_vec();
        *cursor = name_end + 1;
        children.push(parse_node(data, cursor, &child_name)?);
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(CacheTreeNode {
        name: BString::from(name),
        entry_count,
        oid,
        children,
    })
}

fn serialize_node(node: &CacheTreeNode, buf: &mut Vec<u8>, is_root: bool) {
    if !is_root {
        buf.extend_from_slice(&node.name);
        buf.push(0);
    }
    buf.extend_from_slice(node.entry_count.to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(node.children.len().to_string().as_bytes());
    buf.push(b'\n');
    if node.entry_count >= 0 {
        if let Some(ref oid) = node.oid {
            buf.extend_from_slice(oid.as_bytes());
        }
    }
    for child in &node.children {
        serialize_node(child, buf, false);
    }
}

fn invalidate_node(node: &mut CacheTreeNode, path: &[u8]) -> bool {
    match path.iter().position(|&b| b == b'/') {
        Some(pos) => {
            let component = &path[..pos];
            let rest = &path[pos + 1..];
            for child in &mut node.children {
                if child.name.as_bytes() == component && invalidate_node(child, rest) {
                    node.entry_count = -1;
                    node.oid = None;
                    return true;
                }
            }
            false
        }
        None => {
            node.entry_count = -1;
            node.oid = None;
            true
        }
    }
}

fn parse_ascii_int(data: &[u8], cursor: &mut usize, terminator: u8) -> Result<i32, IndexError> {
    let end = data[*cursor..]
        .iter()
        .position(|&b| b == terminator)
        .ok_or_else(|| invalid_tree("missing count terminator"))?
        + *cursor;
    let text = std::str::from_utf8(&data[*cursor..end])
        .map_err(|_| invalid_tree("non-ASCII count"))?;
    let value: i32 = text
        .parse()
        .map_err(|_| invalid_tree("unparsable count"))?;
    *cursor = end + 1;
    Ok(value)
}

fn invalid_tree(reason: &str) -> IndexError {
    IndexError::InvalidExtension {
        sig: "TREE".into(),
        reason: reason.into(),
    }
}
