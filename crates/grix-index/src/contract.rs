//! Sparse-index contraction: full index → sparse index.

use bstr::{BStr, BString, ByteSlice};
use grix_config::ConfigFile;
use grix_odb::ObjectStore;

use crate::sparse::{DirMatch, SparseCheckout};
use crate::tree::{CacheTree, CacheTreeNode};
use crate::{Index, IndexEntry, IndexError, Stage};

/// Environment override for the sparse-index gate: `1` forces it on,
/// `0` forces it off, anything else defers to repository state.
pub const SPARSE_INDEX_ENV: &str = "SPARSE_INDEX_TEST";

/// Result of a contraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// The conversion ran and the entry array was rewritten.
    Converted,
    /// The index already is sparse; nothing to do.
    AlreadySparse,
    /// A precondition failed benignly; the index is unchanged.
    Skipped(&'static str),
}

/// The configuration surface consumed by the sparse-index gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseIndexSettings {
    /// `core.sparsecheckout`
    pub sparse_checkout: bool,
    /// `core.sparsecheckoutcone`
    pub cone_mode: bool,
    /// `index.sparse`
    pub sparse_index: bool,
    /// `extensions.sparseindex` repository-format marker.
    pub repo_extension: bool,
}

impl SparseIndexSettings {
    pub fn from_config(config: &ConfigFile) -> Self {
        Self {
            sparse_checkout: config.bool_or("core.sparsecheckout", false),
            cone_mode: config.bool_or("core.sparsecheckoutcone", false),
            sparse_index: config.bool_or("index.sparse", false),
            repo_extension: config.bool_or("extensions.sparseindex", false),
        }
    }

    /// Whether the sparse-index representation is wanted.
    ///
    /// Precedence: the `SPARSE_INDEX_TEST` environment override, then the
    /// repository extension marker, then the `index.sparse` key.
    pub fn sparse_index_wanted(&self) -> bool {
        self.wanted_with_env(std::env::var(SPARSE_INDEX_ENV).ok().as_deref())
    }

    fn wanted_with_env(&self, env_override: Option<&str>) -> bool {
        match env_override {
            Some("1") => true,
            Some("0") => false,
            _ => {
                if self.repo_extension {
                    true
                } else {
                    self.sparse_index
                }
            }
        }
    }
}

/// Convert a full index to the sparse representation.
///
/// Collapses every subtree that lies fully outside the sparse cone and
/// whose entries are all stage-0, non-submodule, and skip-worktree into a
/// single sparse-directory entry carrying the subtree's cache-tree OID.
///
/// Preconditions that fail benignly (`Skipped`): the sparse-index gate is
/// off, a split index is in use, sparse checkout is disabled, or the cache
/// tree cannot be built. A non-cone pattern list with the sparse index
/// requested is a user error. Running on an already-sparse index is a
/// no-op.
pub fn convert_to_sparse(
    index: &mut Index,
    store: &ObjectStore,
    checkout: &SparseCheckout,
    settings: &SparseIndexSettings,
) -> Result<ConvertOutcome, IndexError> {
    if index.is_sparse() {
        return Ok(ConvertOutcome::AlreadySparse);
    }
    if !settings.sparse_index_wanted() {
        return Ok(ConvertOutcome::Skipped("sparse index not enabled"));
    }
    if index.split_index() {
        return Ok(ConvertOutcome::Skipped("split index in use"));
    }
    if !checkout.enabled {
        return Ok(ConvertOutcome::Skipped("sparse checkout disabled"));
    }
    if !checkout.cone_mode {
        return Err(IndexError::SparseWithoutCone);
    }

    // The cache tree supplies the subtree spans and OIDs. It is produced
    // by a collaborator; when it cannot be updated we stay full.
    let cache_tree = match CacheTree::from_index(index, store) {
        Ok(tree) => tree,
        Err(_) => return Ok(ConvertOutcome::Skipped("cache tree update failed")),
    };

    let mut contracted = Vec::with_capacity(index.len());
    contract_node(
        index.entries(),
        &cache_tree.root,
        BStr::new(""),
        0,
        checkout,
        &mut contracted,
    )?;

    index.replace_entries(contracted);
    // The cache tree's spans no longer line up; rebuild on next save. The
    // fs-monitor token's path domain no longer matches either.
    index.set_cache_tree(None);
    index.set_fsmonitor_token(None);

    Ok(ConvertOutcome::Converted)
}

/// Walk one cache-tree node, emitting contracted entries for its span.
fn contract_node(
    entries: &[IndexEntry],
    node: &CacheTreeNode,
    node_path: &BStr,
    span_start: usize,
    checkout: &SparseCheckout,
    out: &mut Vec<IndexEntry>,
) -> Result<(), IndexError> {
    let span_len = node.span_len().ok_or_else(|| {
        IndexError::CacheTree(format!("invalid node for '{node_path}'"))
    })?;
    let span_end = span_start + span_len;
    let prefix_len = if node_path.is_empty() {
        0
    } else {
        node_path.len() + 1
    };

    let mut pos = span_start;
    while pos < span_end {
        let rel = &entries[pos].path[prefix_len..];
        match rel.find_byte(b'/') {
            None => {
                // Direct file entry of this directory level.
                out.push(entries[pos].clone());
                pos += 1;
            }
            Some(slash) => {
                let name = rel[..slash].as_bstr();
                let child = node.child(name).ok_or_else(|| {
                    IndexError::CacheTree(format!(
                        "no subtree for '{name}' under '{node_path}'"
                    ))
                })?;
                let child_len = child.span_len().ok_or_else(|| {
                    IndexError::CacheTree(format!("invalid subtree '{name}'"))
                })?;
                let child_path = join_path(node_path, name);

                let collapse = checkout.dir_match(child_path.as_bstr()) == DirMatch::NotMatched
                    && child.is_valid()
                    && span_is_collapsible(&entries[pos..pos + child_len]);

                if collapse {
                    let mut dir_path = child_path.clone();
                    dir_path.push(b'/');
                    out.push(IndexEntry::sparse_dir(
                        dir_path,
                        child.oid.expect("valid node has an OID"),
                    ));
                } else {
                    contract_node(entries, child, child_path.as_bstr(), pos, checkout, out)?;
                }
                pos += child_len;
            }
        }
    }
    Ok(())
}

/// A span may collapse only when every entry is stage-0, not a submodule
/// link, and carries the skip-worktree bit.
fn span_is_collapsible(span: &[IndexEntry]) -> bool {
    span.iter().all(|entry| {
        entry.stage == Stage::Normal
            && !entry.mode.is_gitlink()
            && entry.flags.skip_worktree
    })
}

fn join_path(parent: &BStr, name: &BStr) -> BString {
    if parent.is_empty() {
        BString::from(name.as_bytes())
    } else {
        let mut path = BString::from(parent.as_bytes());
        path.push(b'/');
        path.extend_from_slice(name.as_bytes());
        path
    }
}
