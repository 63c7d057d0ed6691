use criterion::{black_box, criterion_group, criterion_main, Criterion};
use grix_hash::{HashAlgorithm, ObjectId};
use grix_pack::midx::{write_midx, MidxEntry, MultiPackIndex};

fn oid_for(i: u32) -> ObjectId {
    let mut bytes = [0u8; 20];
    bytes[0..4].copy_from_slice(&(i.wrapping_mul(2654435761)).to_be_bytes());
    bytes[4..8].copy_from_slice(&i.to_be_bytes());
    ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
}

fn bench_lookup(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..16).map(|i| format!("pack-{i:02}.pack")).collect();
    let entries: Vec<MidxEntry> = (0..50_000u32)
        .map(|i| MidxEntry {
            oid: oid_for(i),
            pack_id: i % 16,
            offset: u64::from(i) * 64 + 12,
            mtime: 0,
        })
        .collect();

    let path = write_midx(dir.path(), &names, entries, None).unwrap();
    let midx = MultiPackIndex::open(&path).unwrap();

    c.bench_function("midx_lookup_hit", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 7919) % 50_000;
            black_box(midx.lookup(&oid_for(i)))
        })
    });

    c.bench_function("midx_lookup_miss", |b| {
        let missing = ObjectId::from_hex("ffffffffffffffffffffffffffffffffffffffff").unwrap();
        b.iter(|| black_box(midx.lookup(&missing)))
    });
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
