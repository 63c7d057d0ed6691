//! Memory-mapped MIDX reader.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use grix_hash::{hasher, FanoutTable, HashAlgorithm, HashError, ObjectId};
use memmap2::Mmap;

use crate::chunk::ChunkTable;
use crate::index::PackIndex;
use crate::PackError;

use super::{
    idx_name_for, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT,
    CHUNK_OID_LOOKUP, CHUNK_PACK_LOOKUP, CHUNK_PACK_NAMES, LARGE_OFFSET_FLAG,
    MIDX_HEADER_SIZE, MIDX_SIGNATURE, MIDX_VERSION,
};

/// A successful cross-pack lookup with the pack index materialized.
pub struct Located {
    pub pack_id: u32,
    pub offset: u64,
    pub pack: Arc<PackIndex>,
}

/// Memory-mapped multi-pack index.
///
/// Owns the mapping and a lazily populated pack-index slot per referenced
/// pack; everything is released together on drop. Lookups are read-only
/// and safe to share; slot population publishes through [`OnceLock`], so
/// concurrent first lookups cannot tear a pack handle.
#[derive(Debug)]
pub struct MultiPackIndex {
    data: Mmap,
    midx_path: PathBuf,
    pack_dir: PathBuf,
    algo: HashAlgorithm,
    num_objects: u32,
    pack_names: Vec<String>,
    fanout: FanoutTable,
    oid_lookup: Range<usize>,
    object_offsets: Range<usize>,
    large_offsets: Option<Range<usize>>,
    packs: Vec<OnceLock<Option<Arc<PackIndex>>>>,
    checksum: ObjectId,
}

impl MultiPackIndex {
    /// Open and fully validate a MIDX file.
    ///
    /// Rejects short files, bad magic, unsupported versions, hash-width
    /// mismatches, malformed chunk tables, missing required chunks, and
    /// checksum mismatches.
    pub fn open(midx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let midx_path = midx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&midx_path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < MIDX_HEADER_SIZE {
            return Err(PackError::InvalidMidx(format!(
                "{}: file too small",
                midx_path.display()
            )));
        }
        if data[0..4] != MIDX_SIGNATURE {
            return Err(PackError::InvalidMidx(format!(
                "{}: bad signature",
                midx_path.display()
            )));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != MIDX_VERSION {
            return Err(PackError::InvalidMidx(format!(
                "{}: unsupported version {version:#x}",
                midx_path.display()
            )));
        }
        let algo = HashAlgorithm::from_version_byte(data[8]).ok_or_else(|| {
            PackError::InvalidMidx(format!(
                "{}: unsupported hash version {}",
                midx_path.display(),
                data[8]
            ))
        })?;
        let hash_len = algo.digest_len();
        if data[9] as usize != hash_len {
            return Err(PackError::InvalidMidx(format!(
                "{}: hash length {} does not match hash version",
                midx_path.display(),
                data[9]
            )));
        }
        if data[10] != 0 {
            return Err(PackError::InvalidMidx(format!(
                "{}: base MIDX layering is not supported",
                midx_path.display()
            )));
        }
        let num_chunks = data[11] as usize;
        let num_packs = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

        let stored = match hasher::verify_trailing(&data, algo) {
            Ok(stored) => stored,
            Err(HashError::ChecksumMismatch { stored, computed }) => {
                return Err(PackError::ChecksumMismatch {
                    expected: stored,
                    actual: computed,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let table = ChunkTable::parse(&data, MIDX_HEADER_SIZE, num_chunks, hash_len)?;
        let ploo = table.require(CHUNK_PACK_LOOKUP)?;
        let pnam = table.require(CHUNK_PACK_NAMES)?;
        let oidf = table.require(CHUNK_OID_FANOUT)?;
        let oid_lookup = table.require(CHUNK_OID_LOOKUP)?;
        let object_offsets = table.require(CHUNK_OBJECT_OFFSETS)?;
        let large_offsets = table.get(CHUNK_LARGE_OFFSETS);

        if oidf.len() != FanoutTable::ON_DISK_SIZE {
            return Err(PackError::InvalidMidx(format!(
                "{}: fan-out chunk has {} bytes",
                midx_path.display(),
                oidf.len()
            )));
        }
        let fanout = FanoutTable::from_bytes(&data[oidf])?;
        let num_objects = fanout.total();

        let n = num_objects as usize;
        if oid_lookup.len() != n * hash_len {
            return Err(PackError::InvalidMidx(format!(
                "{}: OID lookup is {} bytes for {n} objects",
                midx_path.display(),
                oid_lookup.len()
            )));
        }
        if object_offsets.len() != n * 8 {
            return Err(PackError::InvalidMidx(format!(
                "{}: object offsets chunk is {} bytes for {n} objects",
                midx_path.display(),
                object_offsets.len()
            )));
        }
        if ploo.len() != num_packs as usize * 4 {
            return Err(PackError::InvalidMidx(format!(
                "{}: pack-name lookup is {} bytes for {num_packs} packs",
                midx_path.display(),
                ploo.len()
            )));
        }

        let pack_names = parse_pack_names(&data, &ploo, &pnam, num_packs, &midx_path)?;

        let pack_dir = midx_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let packs = (0..num_packs).map(|_| OnceLock::new()).collect();

        Ok(Self {
            data,
            midx_path,
            pack_dir,
            algo,
            num_objects,
            pack_names,
            fanout,
            oid_lookup,
            object_offsets,
            large_offsets,
            packs,
            checksum: stored,
        })
    }

    /// Look up an OID. Returns the on-disk `(pack_id, offset)` pair.
    pub fn lookup(&self, oid: &ObjectId) -> Option<(u32, u64)> {
        let position = self.position_of(oid)?;
        Some(self.entry_at(position))
    }

    /// Entry at sorted position `i`.
    pub fn nth(&self, i: u32) -> Option<(ObjectId, u32, u64)> {
        if i >= self.num_objects {
            return None;
        }
        let oid = ObjectId::from_bytes(self.oid_bytes(i as usize), self.algo)
            .expect("bounds imply a valid OID slice");
        let (pack_id, offset) = self.entry_at(i as usize);
        Some((oid, pack_id, offset))
    }

    /// Whether `name` is one of the referenced packs.
    pub fn contains_pack(&self, name: &str) -> bool {
        self.pack_names.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// Look up an OID and materialize its pack index.
    ///
    /// Returns `None` both for unknown OIDs and for hits whose pack has
    /// disappeared or whose index cannot be opened: a MIDX may legitimately
    /// outlive a pack, and the caller is expected to fall back to other
    /// object sources.
    pub fn locate(&self, oid: &ObjectId) -> Option<Located> {
        let (pack_id, offset) = self.lookup(oid)?;
        let pack = self.pack_index(pack_id)?;
        Some(Located {
            pack_id,
            offset,
            pack,
        })
    }

    /// Lazily open the pack index for on-disk pack id `pack_id`.
    ///
    /// The result (including a failed open) is memoized in the per-pack
    /// slot, so a vanished pack is probed once, not per lookup.
    pub fn pack_index(&self, pack_id: u32) -> Option<Arc<PackIndex>> {
        let slot = self.packs.get(pack_id as usize)?;
        slot.get_or_init(|| {
            let name = &self.pack_names[pack_id as usize];
            let idx_path = self.pack_dir.join(idx_name_for(name));
            PackIndex::open(&idx_path).ok().map(Arc::new)
        })
        .clone()
    }

    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    pub fn num_packs(&self) -> u32 {
        self.pack_names.len() as u32
    }

    /// Referenced pack names, sorted.
    pub fn pack_names(&self) -> &[String] {
        &self.pack_names
    }

    /// Trailing hash of the file.
    pub fn checksum(&self) -> ObjectId {
        self.checksum
    }

    pub fn path(&self) -> &Path {
        &self.midx_path
    }

    /// Iterate all `(oid, pack_id, offset)` entries in OID order.
    pub fn iter(&self) -> MultiPackIndexIter<'_> {
        MultiPackIndexIter { midx: self, pos: 0 }
    }

    /// Binary-search the sorted position of `oid`, narrowed by fan-out.
    fn position_of(&self, oid: &ObjectId) -> Option<usize> {
        let range = self.fanout.range(oid.first_byte());
        let target = oid.as_bytes();

        let mut low = range.start;
        let mut high = range.end;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.oid_bytes(mid).cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    fn oid_bytes(&self, index: usize) -> &[u8] {
        let hash_len = self.algo.digest_len();
        let start = self.oid_lookup.start + index * hash_len;
        &self.data[start..start + hash_len]
    }

    fn entry_at(&self, index: usize) -> (u32, u64) {
        let pos = self.object_offsets.start + index * 8;
        let pack_id = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);
        let word = u32::from_be_bytes([
            self.data[pos + 4],
            self.data[pos + 5],
            self.data[pos + 6],
            self.data[pos + 7],
        ]);

        let offset = if word & LARGE_OFFSET_FLAG != 0 {
            match &self.large_offsets {
                Some(range) => {
                    let idx = (word & !LARGE_OFFSET_FLAG) as usize;
                    let p = range.start + idx * 8;
                    u64::from_be_bytes([
                        self.data[p],
                        self.data[p + 1],
                        self.data[p + 2],
                        self.data[p + 3],
                        self.data[p + 4],
                        self.data[p + 5],
                        self.data[p + 6],
                        self.data[p + 7],
                    ])
                }
                // Malformed: escape bit without a LOFF chunk. The verifier
                // reports this; lookups fall back to the literal low bits.
                None => (word & !LARGE_OFFSET_FLAG) as u64,
            }
        } else {
            word as u64
        };

        (pack_id, offset)
    }
}

/// Iterator over MIDX entries.
pub struct MultiPackIndexIter<'a> {
    midx: &'a MultiPackIndex,
    pos: u32,
}

impl<'a> Iterator for MultiPackIndexIter<'a> {
    type Item = (ObjectId, u32, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.midx.nth(self.pos)?;
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.midx.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for MultiPackIndexIter<'a> {}

/// Resolve PLOO offsets into PNAM and pull out the null-terminated names.
fn parse_pack_names(
    data: &[u8],
    ploo: &Range<usize>,
    pnam: &Range<usize>,
    num_packs: u32,
    midx_path: &Path,
) -> Result<Vec<String>, PackError> {
    let names_bytes = &data[pnam.clone()];
    let mut names = Vec::with_capacity(num_packs as usize);
    let mut prev_offset: Option<u32> = None;

    for i in 0..num_packs as usize {
        let pos = ploo.start + i * 4;
        let offset = u32::from_be_bytes([
            data[pos],
            data[pos + 1],
            data[pos + 2],
            data[pos + 3],
        ]);
        if let Some(prev) = prev_offset {
            if offset <= prev {
                return Err(PackError::InvalidMidx(format!(
                    "{}: pack-name lookup not strictly increasing at entry {i}",
                    midx_path.display()
                )));
            }
        }
        prev_offset = Some(offset);

        let start = offset as usize;
        if start >= names_bytes.len() {
            return Err(PackError::InvalidMidx(format!(
                "{}: pack-name offset {offset} outside PNAM chunk",
                midx_path.display()
            )));
        }
        let end = names_bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or_else(|| {
                PackError::InvalidMidx(format!(
                    "{}: unterminated pack name at offset {offset}",
                    midx_path.display()
                ))
            })?;
        let name = std::str::from_utf8(&names_bytes[start..end])
            .map_err(|_| {
                PackError::InvalidMidx(format!(
                    "{}: pack name at offset {offset} is not UTF-8",
                    midx_path.display()
                ))
            })?
            .to_string();
        names.push(name);
    }

    for pair in names.windows(2) {
        if pair[0] >= pair[1] {
            return Err(PackError::InvalidMidx(format!(
                "{}: pack names not sorted: {:?} before {:?}",
                midx_path.display(),
                pair[0],
                pair[1]
            )));
        }
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::super::write::{write_midx, MidxEntry};
    use super::*;

    fn make_oid(first_byte: u8, suffix: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        bytes[19] = suffix;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    fn build_sample(dir: &Path) -> PathBuf {
        let names = vec!["b.pack".to_string(), "a.pack".to_string()];
        let entries = vec![
            MidxEntry {
                oid: make_oid(0x10, 1),
                pack_id: 0, // b.pack → on-disk id 1
                offset: 100,
                mtime: 0,
            },
            MidxEntry {
                oid: make_oid(0x80, 1),
                pack_id: 1, // a.pack → on-disk id 0
                offset: 200,
                mtime: 0,
            },
        ];
        write_midx(dir, &names, entries, None).unwrap()
    }

    #[test]
    fn open_lookup_nth() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_sample(dir.path());
        let midx = MultiPackIndex::open(&path).unwrap();

        assert_eq!(midx.num_objects(), 2);
        assert_eq!(midx.num_packs(), 2);
        assert_eq!(midx.pack_names(), ["a.pack", "b.pack"]);

        assert_eq!(midx.lookup(&make_oid(0x10, 1)), Some((1, 100)));
        assert_eq!(midx.lookup(&make_oid(0x80, 1)), Some((0, 200)));
        assert_eq!(midx.lookup(&make_oid(0x10, 2)), None);

        assert_eq!(midx.nth(0), Some((make_oid(0x10, 1), 1, 100)));
        assert_eq!(midx.nth(1), Some((make_oid(0x80, 1), 0, 200)));
        assert_eq!(midx.nth(2), None);

        assert!(midx.contains_pack("a.pack"));
        assert!(midx.contains_pack("b.pack"));
        assert!(!midx.contains_pack("c.pack"));
    }

    #[test]
    fn iterator_is_sorted_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_sample(dir.path());
        let midx = MultiPackIndex::open(&path).unwrap();

        let items: Vec<_> = midx.iter().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].0 < items[1].0);
        assert_eq!(midx.iter().len(), 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_sample(dir.path());
        let mut data = std::fs::read(&path).unwrap();
        data[0] = b'X';
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            MultiPackIndex::open(&path).unwrap_err(),
            PackError::InvalidMidx(_)
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_sample(dir.path());
        let mut data = std::fs::read(&path).unwrap();
        data[7] = 2;
        std::fs::write(&path, &data).unwrap();
        assert!(MultiPackIndex::open(&path).is_err());
    }

    #[test]
    fn rejects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_sample(dir.path());
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 1]).unwrap();
        assert!(MultiPackIndex::open(&path).is_err());
    }

    #[test]
    fn rejects_flipped_payload_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_sample(dir.path());
        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0x40;
        std::fs::write(&path, &data).unwrap();
        // Either the checksum or a structural check must refuse this.
        assert!(MultiPackIndex::open(&path).is_err());
    }

    #[test]
    fn stale_pack_degrades_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_sample(dir.path());
        let midx = MultiPackIndex::open(&path).unwrap();

        // No .idx files exist at all, so locate declines every hit.
        assert!(midx.lookup(&make_oid(0x10, 1)).is_some());
        assert!(midx.locate(&make_oid(0x10, 1)).is_none());
    }
}
