//! MIDX builder.

use std::io::Write;
use std::path::{Path, PathBuf};

use grix_hash::{FanoutTable, HashAlgorithm, ObjectId};
use grix_utils::tempfile::TempFile;

use crate::chunk::ChunkWriter;
use crate::PackError;

use super::{
    midx_file_name, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT,
    CHUNK_OID_LOOKUP, CHUNK_PACK_LOOKUP, CHUNK_PACK_NAMES, LARGE_OFFSET_FLAG,
    MIDX_HEADER_SIZE, MIDX_SIGNATURE, MIDX_VERSION,
};

/// One object location fed to the builder.
///
/// `pack_id` indexes the builder's input pack list (pre-sort); the id
/// written to disk is assigned after the pack names are sorted. `mtime`
/// only participates in deduplication: of two entries for the same OID the
/// one with the smaller mtime survives, so freshly built entries (mtime 0)
/// take precedence over re-discovered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidxEntry {
    pub oid: ObjectId,
    pub pack_id: u32,
    pub offset: u64,
    pub mtime: u32,
}

/// Build a MIDX file from pack names and object locations.
///
/// Writes to a `tmp_midx_*` file in `pack_dir`, then renames to `output`
/// if given, or to `midx-<hex-of-trailing-hash>.midx` otherwise. Returns
/// the final path.
pub fn write_midx(
    pack_dir: &Path,
    pack_names: &[String],
    entries: Vec<MidxEntry>,
    output: Option<&Path>,
) -> Result<PathBuf, PackError> {
    let plan = MidxPlan::prepare(pack_names, entries)?;

    let mut tmp = TempFile::with_prefix_in("tmp_midx_", pack_dir)?;
    let hash = plan.write_to(&mut tmp)?;

    let final_path = match output {
        Some(path) => path.to_path_buf(),
        None => pack_dir.join(midx_file_name(&hash)),
    };
    tmp.persist(&final_path)?;
    Ok(final_path)
}

/// Fully resolved layout, ready to stream.
#[derive(Debug)]
struct MidxPlan {
    /// Pack names in on-disk (sorted) order.
    sorted_names: Vec<String>,
    /// Deduplicated entries in OID order, pack ids already remapped.
    entries: Vec<MidxEntry>,
    /// Offsets routed through LOFF, in OOFF emission order.
    large_offsets: Vec<u64>,
    algo: HashAlgorithm,
}

impl MidxPlan {
    fn prepare(pack_names: &[String], mut entries: Vec<MidxEntry>) -> Result<Self, PackError> {
        // Sort pack names and record the pre-sort → post-sort permutation.
        let mut order: Vec<usize> = (0..pack_names.len()).collect();
        order.sort_by(|&a, &b| pack_names[a].cmp(&pack_names[b]));

        let sorted_names: Vec<String> =
            order.iter().map(|&i| pack_names[i].clone()).collect();
        for pair in sorted_names.windows(2) {
            if pair[0] == pair[1] {
                return Err(PackError::InvalidMidx(format!(
                    "duplicate pack name: {}",
                    pair[0]
                )));
            }
        }

        let mut perm = vec![0u32; pack_names.len()];
        for (post, &pre) in order.iter().enumerate() {
            perm[pre] = post as u32;
        }

        for entry in &mut entries {
            let pre = entry.pack_id as usize;
            if pre >= pack_names.len() {
                return Err(PackError::InvalidMidx(format!(
                    "entry {} references pack id {pre} of {} packs",
                    entry.oid,
                    pack_names.len()
                )));
            }
            entry.pack_id = perm[pre];
        }

        // Sort by OID; ties prefer the older (smaller) mtime, then the
        // lower pack id, and dedup keeps the first occurrence.
        entries.sort_by(|a, b| {
            a.oid
                .cmp(&b.oid)
                .then(a.mtime.cmp(&b.mtime))
                .then(a.pack_id.cmp(&b.pack_id))
        });
        entries.dedup_by(|next, kept| next.oid == kept.oid);

        for pair in entries.windows(2) {
            assert!(pair[0].oid < pair[1].oid, "OID lookup out of order after sort");
        }

        let large_offsets: Vec<u64> = entries
            .iter()
            .filter(|e| e.offset > i32::MAX as u64)
            .map(|e| e.offset)
            .collect();

        Ok(Self {
            sorted_names,
            entries,
            large_offsets,
            algo: HashAlgorithm::Sha1,
        })
    }

    fn header(&self, num_chunks: u8) -> [u8; MIDX_HEADER_SIZE] {
        let mut header = [0u8; MIDX_HEADER_SIZE];
        header[0..4].copy_from_slice(&MIDX_SIGNATURE);
        header[4..8].copy_from_slice(&MIDX_VERSION.to_be_bytes());
        header[8] = self.algo.version_byte();
        header[9] = self.algo.digest_len() as u8;
        header[10] = 0; // base MIDX count
        header[11] = num_chunks;
        header[12..16].copy_from_slice(&(self.sorted_names.len() as u32).to_be_bytes());
        header
    }

    fn write_to<W: Write>(&self, out: W) -> Result<ObjectId, PackError> {
        let hash_len = self.algo.digest_len() as u64;
        let n = self.entries.len() as u64;
        let pack_count = self.sorted_names.len() as u64;
        let names_len: u64 = self
            .sorted_names
            .iter()
            .map(|name| name.len() as u64 + 1)
            .sum();

        let mut writer = ChunkWriter::new(out, self.algo);
        writer.add_chunk(CHUNK_PACK_LOOKUP, pack_count * 4);
        writer.add_chunk(CHUNK_PACK_NAMES, names_len);
        writer.add_chunk(CHUNK_OID_FANOUT, FanoutTable::ON_DISK_SIZE as u64);
        writer.add_chunk(CHUNK_OID_LOOKUP, n * hash_len);
        writer.add_chunk(CHUNK_OBJECT_OFFSETS, n * 8);
        let num_chunks = if self.large_offsets.is_empty() {
            5
        } else {
            writer.add_chunk(CHUNK_LARGE_OFFSETS, self.large_offsets.len() as u64 * 8);
            6
        };

        writer.begin(&self.header(num_chunks))?;

        writer.write_chunk(CHUNK_PACK_LOOKUP, |out| {
            let mut offset = 0u32;
            for name in &self.sorted_names {
                out.write_all(&offset.to_be_bytes())?;
                offset += name.len() as u32 + 1;
            }
            Ok(())
        })?;

        writer.write_chunk(CHUNK_PACK_NAMES, |out| {
            for name in &self.sorted_names {
                out.write_all(name.as_bytes())?;
                out.write_all(&[0])?;
            }
            Ok(())
        })?;

        let fanout =
            FanoutTable::build_with(self.entries.len(), |i| self.entries[i].oid.first_byte());
        writer.write_chunk(CHUNK_OID_FANOUT, |out| out.write_all(&fanout.to_bytes()))?;

        writer.write_chunk(CHUNK_OID_LOOKUP, |out| {
            for entry in &self.entries {
                out.write_all(entry.oid.as_bytes())?;
            }
            Ok(())
        })?;

        writer.write_chunk(CHUNK_OBJECT_OFFSETS, |out| {
            let mut next_large = 0u32;
            for entry in &self.entries {
                out.write_all(&entry.pack_id.to_be_bytes())?;
                let word = if entry.offset > i32::MAX as u64 {
                    let escape = LARGE_OFFSET_FLAG | next_large;
                    next_large += 1;
                    escape
                } else {
                    entry.offset as u32
                };
                out.write_all(&word.to_be_bytes())?;
            }
            Ok(())
        })?;

        if !self.large_offsets.is_empty() {
            writer.write_chunk(CHUNK_LARGE_OFFSETS, |out| {
                for offset in &self.large_offsets {
                    out.write_all(&offset.to_be_bytes())?;
                }
                Ok(())
            })?;
        }

        writer.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_oid(first_byte: u8, suffix: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        bytes[19] = suffix;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    fn entry(oid: ObjectId, pack_id: u32, offset: u64, mtime: u32) -> MidxEntry {
        MidxEntry {
            oid,
            pack_id,
            offset,
            mtime,
        }
    }

    #[test]
    fn pack_ids_remap_through_sort_permutation() {
        // Packs given in reverse order: pre-sort id 0 = "z.pack" must
        // come out as on-disk id 1.
        let names = vec!["z.pack".to_string(), "a.pack".to_string()];
        let entries = vec![
            entry(make_oid(0x10, 1), 0, 100, 0),
            entry(make_oid(0x20, 1), 1, 200, 0),
        ];
        let plan = MidxPlan::prepare(&names, entries).unwrap();
        assert_eq!(plan.sorted_names, ["a.pack", "z.pack"]);
        assert_eq!(plan.entries[0].pack_id, 1);
        assert_eq!(plan.entries[1].pack_id, 0);
    }

    #[test]
    fn dedup_keeps_smallest_mtime() {
        let oid = make_oid(0x42, 7);
        let names = vec!["p.pack".to_string()];
        let entries = vec![
            entry(oid, 0, 555, 5),
            entry(oid, 0, 111, 0),
        ];
        let plan = MidxPlan::prepare(&names, entries).unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].offset, 111);
        assert_eq!(plan.entries[0].mtime, 0);
    }

    #[test]
    fn duplicate_pack_names_rejected() {
        let names = vec!["same.pack".to_string(), "same.pack".to_string()];
        assert!(matches!(
            MidxPlan::prepare(&names, Vec::new()).unwrap_err(),
            PackError::InvalidMidx(_)
        ));
    }

    #[test]
    fn out_of_range_pack_id_rejected() {
        let names = vec!["p.pack".to_string()];
        let entries = vec![entry(make_oid(1, 1), 3, 10, 0)];
        assert!(MidxPlan::prepare(&names, entries).is_err());
    }

    #[test]
    fn large_offsets_use_31_bit_threshold() {
        let names = vec!["p.pack".to_string()];
        let entries = vec![
            entry(make_oid(1, 1), 0, 0x7fff_ffff, 0), // literal, fits
            entry(make_oid(2, 1), 0, 0x8000_0000, 0), // escaped
        ];
        let plan = MidxPlan::prepare(&names, entries).unwrap();
        assert_eq!(plan.large_offsets, [0x8000_0000]);
    }

    #[test]
    fn final_name_carries_trailing_hash() {
        let dir = tempfile::tempdir().unwrap();
        let names = vec!["p.pack".to_string()];
        let entries = vec![entry(make_oid(0xab, 1), 0, 42, 0)];

        let path = write_midx(dir.path(), &names, entries, None).unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("midx-"), "got {file_name}");
        assert!(file_name.ends_with(".midx"));

        let data = std::fs::read(&path).unwrap();
        let trailing =
            ObjectId::from_bytes(&data[data.len() - 20..], HashAlgorithm::Sha1).unwrap();
        assert_eq!(file_name, midx_file_name(&trailing));
        // No stray temp files left behind.
        let stray: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_midx_"))
            .collect();
        assert!(stray.is_empty());
    }
}
