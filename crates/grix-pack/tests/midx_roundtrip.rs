//! End-to-end MIDX scenarios: build, read back, verify, corrupt.

use grix_hash::{HashAlgorithm, ObjectId};
use grix_pack::index::write_pack_index;
use grix_pack::midx::{verify_midx, write_midx, MidxEntry, MultiPackIndex};

fn oid(first_byte: u8, suffix: u8) -> ObjectId {
    let mut bytes = [0u8; 20];
    bytes[0] = first_byte;
    bytes[19] = suffix;
    ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
}

fn entry(oid: ObjectId, pack_id: u32, offset: u64) -> MidxEntry {
    MidxEntry {
        oid,
        pack_id,
        offset,
        mtime: 0,
    }
}

/// Two packs handed over in reverse-sorted order, one object each.
#[test]
fn two_packs_sorted_and_looked_up() {
    let dir = tempfile::tempdir().unwrap();

    let names = vec!["test-2.pack".to_string(), "test-1.pack".to_string()];
    let entries = vec![
        entry(oid(0xaa, 0), 1, 100), // test-1.pack
        entry(oid(0xbb, 0), 0, 200), // test-2.pack
    ];
    let path = write_midx(dir.path(), &names, entries, None).unwrap();
    let midx = MultiPackIndex::open(&path).unwrap();

    assert_eq!(midx.pack_names(), ["test-1.pack", "test-2.pack"]);
    assert_eq!(midx.lookup(&oid(0xaa, 0)), Some((0, 100)));
    assert_eq!(midx.lookup(&oid(0xbb, 0)), Some((1, 200)));

    // Pack Names chunk must be exactly the sorted concatenation.
    let data = std::fs::read(&path).unwrap();
    let needle = b"test-1.pack\0test-2.pack\0";
    assert!(
        data.windows(needle.len()).any(|w| w == needle),
        "PNAM does not hold the sorted null-terminated names"
    );

    // No large-offset chunk for small offsets.
    assert!(!data.windows(4).any(|w| w == b"LOFF"));
}

/// A 2^32 offset goes through the large-offset escape.
#[test]
fn large_offset_escape() {
    let dir = tempfile::tempdir().unwrap();

    let big = 0x1_0000_0000u64;
    let names = vec!["big.pack".to_string()];
    let path = write_midx(dir.path(), &names, vec![entry(oid(0x01, 0), 0, big)], None).unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.lookup(&oid(0x01, 0)), Some((0, big)));

    // The OOFF offset word must be the escape for index 0, and LOFF[0]
    // must decode back to the 64-bit offset.
    let data = std::fs::read(&path).unwrap();
    let word = 0x8000_0000u32.to_be_bytes();
    assert!(data.windows(4).any(|w| w == word));
    assert!(data.windows(8).any(|w| w == big.to_be_bytes()));
    assert!(data.windows(4).any(|w| w == b"LOFF"));
}

/// Duplicate OIDs collapse; the older (smaller mtime) entry survives.
#[test]
fn dedup_prefers_older_entry() {
    let dir = tempfile::tempdir().unwrap();

    let shared = oid(0x42, 7);
    let names = vec!["one.pack".to_string(), "two.pack".to_string()];
    let entries = vec![
        MidxEntry {
            oid: shared,
            pack_id: 1,
            offset: 999,
            mtime: 5,
        },
        MidxEntry {
            oid: shared,
            pack_id: 0,
            offset: 100,
            mtime: 0,
        },
        entry(oid(0x99, 1), 0, 1), // distinct object
    ];
    let path = write_midx(dir.path(), &names, entries, None).unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.num_objects(), 2);
    assert_eq!(midx.lookup(&shared), Some((0, 100)));
}

/// Build → read reproduces the input exactly (after dedup and pack sort).
#[test]
fn roundtrip_many_entries() {
    let dir = tempfile::tempdir().unwrap();

    let names = vec![
        "c.pack".to_string(),
        "a.pack".to_string(),
        "b.pack".to_string(),
    ];
    // a.pack→0, b.pack→1, c.pack→2 after sorting.
    let post_id = |pre: u32| [2u32, 0, 1][pre as usize];

    let mut expected: Vec<(ObjectId, u32, u64)> = Vec::new();
    let mut entries = Vec::new();
    for i in 0..200u32 {
        let o = oid((i % 251) as u8, (i / 251 + 1) as u8);
        let pre = i % 3;
        let offset = u64::from(i) * 37 + 11;
        entries.push(entry(o, pre, offset));
        expected.push((o, post_id(pre), offset));
    }
    expected.sort_by(|a, b| a.0.cmp(&b.0));

    let path = write_midx(dir.path(), &names, entries, None).unwrap();
    let midx = MultiPackIndex::open(&path).unwrap();

    assert_eq!(midx.num_objects(), 200);
    let collected: Vec<_> = midx.iter().collect();
    assert_eq!(collected, expected);

    for (o, pack_id, offset) in &expected {
        assert_eq!(midx.lookup(o), Some((*pack_id, *offset)));
    }

    // Strict ascending OID order and fan-out bookkeeping.
    assert!(collected.windows(2).all(|w| w[0].0 < w[1].0));
    let report = verify_midx(&path).unwrap();
    // Packs do not exist on disk: every referenced pack is stale, but the
    // self-contained invariants must all hold.
    assert!(report
        .violations()
        .iter()
        .all(|v| matches!(v, grix_pack::midx::Violation::StalePack { .. })));
}

/// An explicit output path skips the hash-derived name.
#[test]
fn explicit_output_path() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("custom.midx");

    let names = vec!["p.pack".to_string()];
    let path = write_midx(
        dir.path(),
        &names,
        vec![entry(oid(1, 1), 0, 5)],
        Some(&out),
    )
    .unwrap();
    assert_eq!(path, out);
    assert!(MultiPackIndex::open(&out).is_ok());
}

/// Lazy pack materialization against real .idx files, and the
/// stale-reference contract when one pack vanishes after the build.
#[test]
fn lazy_pack_open_and_stale_fallback() {
    let dir = tempfile::tempdir().unwrap();

    let mut one = vec![(oid(0x10, 1), 100u64, 0u32)];
    let mut two = vec![(oid(0x20, 1), 200u64, 0u32)];
    write_pack_index(&dir.path().join("one.idx"), &mut one, &ObjectId::NULL_SHA1).unwrap();
    write_pack_index(&dir.path().join("two.idx"), &mut two, &ObjectId::NULL_SHA1).unwrap();

    let names = vec!["one.pack".to_string(), "two.pack".to_string()];
    let entries = vec![entry(oid(0x10, 1), 0, 100), entry(oid(0x20, 1), 1, 200)];
    let path = write_midx(dir.path(), &names, entries, None).unwrap();

    // A pack removed between build and lookup must degrade, not crash.
    std::fs::remove_file(dir.path().join("two.idx")).unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    let hit = midx.locate(&oid(0x10, 1)).expect("pack one is present");
    assert_eq!(hit.pack_id, 0);
    assert_eq!(hit.offset, 100);
    assert_eq!(hit.pack.lookup(&oid(0x10, 1)), Some(100));

    assert_eq!(midx.lookup(&oid(0x20, 1)), Some((1, 200)));
    assert!(midx.locate(&oid(0x20, 1)).is_none());
}

/// Truncating one byte before the trailing hash: the verifier reports and
/// the reader refuses to open.
#[test]
fn truncation_detected_by_reader_and_verifier() {
    let dir = tempfile::tempdir().unwrap();

    let names = vec!["p.pack".to_string()];
    let path = write_midx(dir.path(), &names, vec![entry(oid(9, 9), 0, 77)], None).unwrap();

    let full = std::fs::read(&path).unwrap();
    let mut truncated = full.clone();
    truncated.remove(full.len() - 21); // drop the byte before the hash
    std::fs::write(&path, &truncated).unwrap();

    assert!(MultiPackIndex::open(&path).is_err());

    let report = verify_midx(&path).unwrap();
    assert!(!report.is_ok());
}

/// The stored checksum is the hash of everything before it.
#[test]
fn trailing_checksum_matches_content() {
    let dir = tempfile::tempdir().unwrap();

    let names = vec!["p.pack".to_string()];
    let path = write_midx(dir.path(), &names, vec![entry(oid(3, 3), 0, 1)], None).unwrap();

    let data = std::fs::read(&path).unwrap();
    let computed =
        grix_hash::hasher::Hasher::digest(HashAlgorithm::Sha1, &data[..data.len() - 20]).unwrap();
    assert_eq!(computed.as_bytes(), &data[data.len() - 20..]);

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.checksum(), computed);
}
