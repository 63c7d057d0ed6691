//! End-to-end sparse-index scenarios: contract, expand, persist.

use grix_hash::ObjectId;
use grix_index::{
    convert_to_sparse, ensure_full_index, expand_to_path, ConvertOutcome, EntryFlags, Index,
    IndexEntry, SparseCheckout, SparseIndexSettings, Stage, StatData,
};
use grix_object::FileMode;
use grix_odb::ObjectStore;

fn file_entry(path: &str, skip_worktree: bool) -> IndexEntry {
    IndexEntry {
        path: path.into(),
        oid: ObjectId::NULL_SHA1,
        mode: FileMode::REGULAR,
        stage: Stage::Normal,
        stat: StatData::default(),
        flags: EntryFlags {
            skip_worktree,
            ..Default::default()
        },
    }
}

fn full_index(paths: &[&str]) -> Index {
    let mut index = Index::new();
    for path in paths {
        index.add(file_entry(path, true));
    }
    index
}

fn settings() -> SparseIndexSettings {
    SparseIndexSettings {
        sparse_checkout: true,
        cone_mode: true,
        sparse_index: true,
        repo_extension: true,
    }
}

fn paths_of(index: &Index) -> Vec<String> {
    index.iter().map(|e| e.path.to_string()).collect()
}

/// Contraction with cone {a} collapses b/ into one entry whose OID is the
/// cache-tree OID of subtree b; a targeted expand brings the files back.
#[test]
fn contract_then_expand_target_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));

    let mut index = full_index(&["a", "b/c", "b/d", "b/e/f"]);
    let checkout = SparseCheckout::cone(["a"]);

    let outcome = convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    assert_eq!(outcome, ConvertOutcome::Converted);
    assert_eq!(paths_of(&index), ["a", "b/"]);

    let sparse = index.find(b"b/".into()).unwrap().clone();
    assert!(sparse.is_sparse_dir());
    assert_eq!(sparse.mode, FileMode::TREE);
    assert!(sparse.flags.skip_worktree);

    // The recorded OID really is the tree of subtree b.
    let tree = store.read_tree(&sparse.oid).unwrap().unwrap();
    assert!(tree.find(b"c".into()).is_some());
    assert!(tree.find(b"d".into()).is_some());
    assert!(tree.find(b"e".into()).unwrap().mode.is_tree());

    expand_to_path(&mut index, &store, b"b/e/f".into()).unwrap();
    assert_eq!(paths_of(&index), ["a", "b/c", "b/d", "b/e/f"]);
    assert!(!index.is_sparse());
}

/// A merge stage under b/ keeps the whole index full, verbatim.
#[test]
fn merge_stage_prevents_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));

    let mut index = full_index(&["a", "b/c", "b/e/f"]);
    let mut conflicted = file_entry("b/d", true);
    conflicted.stage = Stage::Ours;
    index.add(conflicted);

    let checkout = SparseCheckout::cone(["a"]);
    convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();

    assert_eq!(paths_of(&index), ["a", "b/c", "b/d", "b/e/f"]);
    assert!(!index.is_sparse());
}

/// An entry without skip-worktree blocks its subtree, but siblings
/// still collapse.
#[test]
fn skip_worktree_off_blocks_only_its_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));

    let mut index = Index::new();
    index.add(file_entry("a", true));
    index.add(file_entry("b/c", false)); // materialized file
    index.add(file_entry("d/e", true));
    let checkout = SparseCheckout::cone(["a"]);

    convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    assert_eq!(paths_of(&index), ["a", "b/c", "d/"]);
}

/// Full → sparse → full reproduces the original entries.
#[test]
fn sparsify_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));

    let original = [
        "a",
        "deep/x/y/z",
        "keep/file",
        "lib/one.rs",
        "lib/sub/two.rs",
        "zz",
    ];
    let mut index = full_index(&original);
    let checkout = SparseCheckout::cone(["keep"]);

    convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    assert_eq!(paths_of(&index), ["a", "deep/", "keep/file", "lib/", "zz"]);

    ensure_full_index(&mut index, &store).unwrap();
    assert_eq!(paths_of(&index), original);
    assert!(index.iter().all(|e| !e.is_sparse_dir()));
}

/// Contracting an already-sparse index changes nothing.
#[test]
fn idempotent_contraction() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));

    let mut index = full_index(&["a", "b/c", "b/d"]);
    let checkout = SparseCheckout::cone(["a"]);

    convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    let snapshot = paths_of(&index);

    let outcome = convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    assert_eq!(outcome, ConvertOutcome::AlreadySparse);
    assert_eq!(paths_of(&index), snapshot);
}

/// A sparse index survives a disk round-trip: marker emitted, trailing
/// slash preserved, expansion still works afterwards.
#[test]
fn sparse_index_persists_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));
    let index_path = dir.path().join("index");

    let mut index = full_index(&["a", "b/c", "b/d"]);
    let checkout = SparseCheckout::cone(["a"]);
    convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    index.write_to(&index_path).unwrap();

    let mut reloaded = Index::read_from(&index_path).unwrap();
    assert!(reloaded.is_sparse());
    assert_eq!(paths_of(&reloaded), ["a", "b/"]);

    ensure_full_index(&mut reloaded, &store).unwrap();
    assert_eq!(paths_of(&reloaded), ["a", "b/c", "b/d"]);

    // The re-expanded index also round-trips.
    reloaded.write_to(&index_path).unwrap();
    let full_again = Index::read_from(&index_path).unwrap();
    assert!(!full_again.is_sparse());
    assert_eq!(paths_of(&full_again), ["a", "b/c", "b/d"]);
}

/// Deeply nested cones: ancestors of a cone directory stay expanded one
/// level at a time, unrelated subtrees collapse at the highest point.
#[test]
fn cone_ancestors_descend() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));

    let mut index = full_index(&[
        "src/app/main.rs",
        "src/lib/core.rs",
        "src/lib/util.rs",
        "vendor/big/blob1",
        "vendor/big/blob2",
    ]);
    let checkout = SparseCheckout::cone(["src/app"]);

    convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    assert_eq!(
        paths_of(&index),
        ["src/app/main.rs", "src/lib/", "vendor/"]
    );

    // The collapsed vendor/ tree still expands to both blobs.
    ensure_full_index(&mut index, &store).unwrap();
    assert_eq!(
        paths_of(&index),
        [
            "src/app/main.rs",
            "src/lib/core.rs",
            "src/lib/util.rs",
            "vendor/big/blob1",
            "vendor/big/blob2",
        ]
    );
}

/// Executable bits and symlink modes survive collapse and expansion.
#[test]
fn modes_survive_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("objects"));

    let mut index = Index::new();
    index.add(file_entry("keep", true));
    let mut exe = file_entry("tools/run.sh", true);
    exe.mode = FileMode::EXECUTABLE;
    exe.oid = ObjectId::from_hex("1111111111111111111111111111111111111111").unwrap();
    index.add(exe);
    let mut link = file_entry("tools/latest", true);
    link.mode = FileMode::SYMLINK;
    link.oid = ObjectId::from_hex("2222222222222222222222222222222222222222").unwrap();
    index.add(link);

    let checkout = SparseCheckout::cone(["keep"]);
    convert_to_sparse(&mut index, &store, &checkout, &settings()).unwrap();
    assert_eq!(paths_of(&index), ["keep", "tools/"]);

    ensure_full_index(&mut index, &store).unwrap();
    let exe = index.find(b"tools/run.sh".into()).unwrap();
    assert_eq!(exe.mode, FileMode::EXECUTABLE);
    let link = index.find(b"tools/latest".into()).unwrap();
    assert_eq!(link.mode, FileMode::SYMLINK);
    assert!(exe.flags.skip_worktree && link.flags.skip_worktree);
}
