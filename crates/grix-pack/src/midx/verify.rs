//! MIDX verification.
//!
//! Re-derives every file invariant from the mapped bytes, independent of
//! the reader and its caches, and checks the recorded offsets against the
//! underlying pack indexes. All violations are collected; verification
//! never stops at the first problem unless the file is too mangled to walk.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use grix_hash::{hasher, HashAlgorithm, HashError, ObjectId};
use memmap2::Mmap;

use crate::chunk::ChunkTable;
use crate::index::PackIndex;
use crate::PackError;

use super::{
    idx_name_for, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT,
    CHUNK_OID_LOOKUP, CHUNK_PACK_LOOKUP, CHUNK_PACK_NAMES, LARGE_OFFSET_FLAG,
    MIDX_HEADER_SIZE, MIDX_SIGNATURE, MIDX_VERSION,
};

/// One verification failure.
#[derive(Debug)]
pub enum Violation {
    /// Trailing hash does not cover the file contents.
    Checksum {
        expected: ObjectId,
        actual: ObjectId,
    },
    /// The file cannot be walked beyond this point.
    Structure(String),
    /// OID lookup entries out of order at `index`.
    OidOrder { index: u32 },
    /// Fan-out counter disagrees with the OID table.
    Fanout { bucket: u8, stored: u32, actual: u32 },
    /// Pack names unsorted or misindexed.
    PackNames(String),
    /// OOFF references a pack id outside the pack table.
    PackIdRange { index: u32, pack_id: u32 },
    /// Escape bit set but no large-offset chunk, or escape index outside it.
    LargeOffsetEscape { index: u32, word: u32 },
    /// A referenced pack's index cannot be opened.
    StalePack { pack: String },
    /// The pack index disagrees about an object's offset.
    OffsetMismatch {
        oid: ObjectId,
        pack: String,
        midx_offset: u64,
        idx_offset: Option<u64>,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checksum { expected, actual } => {
                write!(f, "checksum mismatch: stored {expected}, computed {actual}")
            }
            Self::Structure(reason) => write!(f, "structural damage: {reason}"),
            Self::OidOrder { index } => {
                write!(f, "OID lookup not strictly ascending at entry {index}")
            }
            Self::Fanout {
                bucket,
                stored,
                actual,
            } => write!(
                f,
                "fan-out[{bucket:#04x}] is {stored}, but {actual} OIDs have first byte <= {bucket:#04x}"
            ),
            Self::PackNames(reason) => write!(f, "pack names: {reason}"),
            Self::PackIdRange { index, pack_id } => {
                write!(f, "entry {index} references pack id {pack_id} outside the pack table")
            }
            Self::LargeOffsetEscape { index, word } => {
                write!(f, "entry {index} offset word {word:#010x} escapes outside the large-offset chunk")
            }
            Self::StalePack { pack } => {
                write!(f, "pack '{pack}' is missing or its index is unreadable")
            }
            Self::OffsetMismatch {
                oid,
                pack,
                midx_offset,
                idx_offset,
            } => match idx_offset {
                Some(idx) => write!(
                    f,
                    "object {oid}: MIDX offset {midx_offset} but pack '{pack}' index has {idx}"
                ),
                None => write!(
                    f,
                    "object {oid}: MIDX offset {midx_offset} but pack '{pack}' does not contain it"
                ),
            },
        }
    }
}

/// Accumulated verification outcome.
#[derive(Debug, Default)]
pub struct VerifyReport {
    violations: Vec<Violation>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "multi-pack index verified");
        }
        writeln!(f, "{} violation(s):", self.violations.len())?;
        for v in &self.violations {
            writeln!(f, "  {v}")?;
        }
        Ok(())
    }
}

/// Verify a MIDX file against its own invariants and its packs.
///
/// Returns `Err` only when the file cannot be opened or walked at all;
/// every derivable invariant failure lands in the report instead.
pub fn verify_midx(midx_path: &Path) -> Result<VerifyReport, PackError> {
    let file = std::fs::File::open(midx_path)?;
    let data = unsafe { Mmap::map(&file)? };
    let mut report = VerifyReport::default();

    if data.len() < MIDX_HEADER_SIZE {
        report.push(Violation::Structure("file shorter than the header".into()));
        return Ok(report);
    }
    if data[0..4] != MIDX_SIGNATURE {
        report.push(Violation::Structure("bad signature".into()));
        return Ok(report);
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != MIDX_VERSION {
        report.push(Violation::Structure(format!(
            "unsupported version {version:#x}"
        )));
        return Ok(report);
    }
    let algo = match HashAlgorithm::from_version_byte(data[8]) {
        Some(algo) => algo,
        None => {
            report.push(Violation::Structure(format!(
                "unsupported hash version {}",
                data[8]
            )));
            return Ok(report);
        }
    };
    let hash_len = algo.digest_len();
    let num_chunks = data[11] as usize;
    let num_packs = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

    // Checksum first: an independent recomputation over everything before
    // the trailing hash.
    match hasher::verify_trailing(&data, algo) {
        Ok(_) => {}
        Err(HashError::ChecksumMismatch { stored, computed }) => {
            report.push(Violation::Checksum {
                expected: stored,
                actual: computed,
            });
        }
        Err(_) => {
            report.push(Violation::Structure(
                "file too small for trailing hash".into(),
            ));
            return Ok(report);
        }
    }

    let table = match ChunkTable::parse(&data, MIDX_HEADER_SIZE, num_chunks, hash_len) {
        Ok(table) => table,
        Err(e) => {
            report.push(Violation::Structure(e.to_string()));
            return Ok(report);
        }
    };

    let required = [
        CHUNK_PACK_LOOKUP,
        CHUNK_PACK_NAMES,
        CHUNK_OID_FANOUT,
        CHUNK_OID_LOOKUP,
        CHUNK_OBJECT_OFFSETS,
    ];
    for id in required {
        if table.get(id).is_none() {
            report.push(Violation::Structure(format!("missing required chunk {id}")));
        }
    }
    let (Some(ploo), Some(pnam), Some(oidf), Some(oidl), Some(ooff)) = (
        table.get(CHUNK_PACK_LOOKUP),
        table.get(CHUNK_PACK_NAMES),
        table.get(CHUNK_OID_FANOUT),
        table.get(CHUNK_OID_LOOKUP),
        table.get(CHUNK_OBJECT_OFFSETS),
    ) else {
        return Ok(report);
    };
    let loff = table.get(CHUNK_LARGE_OFFSETS);

    // Pack names: PLOO aligned, PNAM sorted ascending.
    let pack_names = check_pack_names(&data, &ploo, &pnam, num_packs, &mut report);

    // Fan-out: every counter equals the number of OIDs with first byte <= i.
    if oidf.len() != 1024 {
        report.push(Violation::Structure(format!(
            "fan-out chunk has {} bytes",
            oidf.len()
        )));
        return Ok(report);
    }
    let num_objects = u32::from_be_bytes([
        data[oidf.start + 1020],
        data[oidf.start + 1021],
        data[oidf.start + 1022],
        data[oidf.start + 1023],
    ]);
    let n = num_objects as usize;
    if oidl.len() != n * hash_len || ooff.len() != n * 8 {
        report.push(Violation::Structure(format!(
            "chunk sizes disagree with {n} objects (OIDL {}, OOFF {})",
            oidl.len(),
            ooff.len()
        )));
        return Ok(report);
    }

    let oid_at = |i: usize| &data[oidl.start + i * hash_len..oidl.start + (i + 1) * hash_len];

    for i in 1..n {
        if oid_at(i - 1) >= oid_at(i) {
            report.push(Violation::OidOrder { index: i as u32 });
        }
    }

    let mut cumulative = 0u32;
    let mut entry = 0usize;
    for bucket in 0..=255u8 {
        while entry < n && oid_at(entry)[0] == bucket {
            cumulative += 1;
            entry += 1;
        }
        let stored_count = u32::from_be_bytes([
            data[oidf.start + bucket as usize * 4],
            data[oidf.start + bucket as usize * 4 + 1],
            data[oidf.start + bucket as usize * 4 + 2],
            data[oidf.start + bucket as usize * 4 + 3],
        ]);
        if stored_count != cumulative {
            report.push(Violation::Fanout {
                bucket,
                stored: stored_count,
                actual: cumulative,
            });
        }
    }

    // Per-entry offsets against the underlying pack indexes. Pack indexes
    // are opened once; a pack that cannot be opened is reported once and
    // its entries are skipped.
    let pack_dir = midx_path.parent().unwrap_or(Path::new("."));
    let mut opened: BTreeMap<u32, Option<PackIndex>> = BTreeMap::new();

    for i in 0..n {
        let pos = ooff.start + i * 8;
        let pack_id = u32::from_be_bytes([
            data[pos],
            data[pos + 1],
            data[pos + 2],
            data[pos + 3],
        ]);
        let word = u32::from_be_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);

        let midx_offset = if word & LARGE_OFFSET_FLAG != 0 {
            let idx = (word & !LARGE_OFFSET_FLAG) as usize;
            match &loff {
                Some(range) if (idx + 1) * 8 <= range.len() => {
                    let p = range.start + idx * 8;
                    u64::from_be_bytes([
                        data[p],
                        data[p + 1],
                        data[p + 2],
                        data[p + 3],
                        data[p + 4],
                        data[p + 5],
                        data[p + 6],
                        data[p + 7],
                    ])
                }
                _ => {
                    report.push(Violation::LargeOffsetEscape {
                        index: i as u32,
                        word,
                    });
                    continue;
                }
            }
        } else {
            word as u64
        };

        if pack_id >= num_packs {
            report.push(Violation::PackIdRange {
                index: i as u32,
                pack_id,
            });
            continue;
        }
        let Some(pack_name) = pack_names.get(pack_id as usize) else {
            continue; // already reported by check_pack_names
        };

        let slot = opened.entry(pack_id).or_insert_with(|| {
            let idx_path = pack_dir.join(idx_name_for(pack_name));
            match PackIndex::open(&idx_path) {
                Ok(idx) => Some(idx),
                Err(_) => {
                    report.push(Violation::StalePack {
                        pack: pack_name.clone(),
                    });
                    None
                }
            }
        });
        let Some(idx) = slot else { continue };

        let oid = ObjectId::from_bytes(oid_at(i), algo)?;
        let idx_offset = idx.lookup(&oid);
        if idx_offset != Some(midx_offset) {
            report.push(Violation::OffsetMismatch {
                oid,
                pack: pack_name.clone(),
                midx_offset,
                idx_offset,
            });
        }
    }

    Ok(report)
}

/// Validate PLOO/PNAM and return the names (best effort on damage).
fn check_pack_names(
    data: &[u8],
    ploo: &std::ops::Range<usize>,
    pnam: &std::ops::Range<usize>,
    num_packs: u32,
    report: &mut VerifyReport,
) -> Vec<String> {
    let mut names = Vec::new();

    if ploo.len() != num_packs as usize * 4 {
        report.push(Violation::PackNames(format!(
            "lookup chunk has {} bytes for {num_packs} packs",
            ploo.len()
        )));
        return names;
    }

    let names_bytes = &data[pnam.clone()];
    let mut prev_offset: Option<u32> = None;
    for i in 0..num_packs as usize {
        let pos = ploo.start + i * 4;
        let offset =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        if prev_offset.is_some_and(|prev| offset <= prev) {
            report.push(Violation::PackNames(format!(
                "lookup offsets not strictly increasing at entry {i}"
            )));
        }
        prev_offset = Some(offset);

        let start = offset as usize;
        if start >= names_bytes.len() {
            report.push(Violation::PackNames(format!(
                "entry {i} offset {offset} outside the names chunk"
            )));
            names.push(String::new());
            continue;
        }
        match names_bytes[start..].iter().position(|&b| b == 0) {
            Some(len) => match std::str::from_utf8(&names_bytes[start..start + len]) {
                Ok(name) => names.push(name.to_string()),
                Err(_) => {
                    report.push(Violation::PackNames(format!(
                        "entry {i} is not UTF-8"
                    )));
                    names.push(String::new());
                }
            },
            None => {
                report.push(Violation::PackNames(format!(
                    "entry {i} has no null terminator"
                )));
                names.push(String::new());
            }
        }
    }

    for (i, pair) in names.windows(2).enumerate() {
        if !pair[0].is_empty() && !pair[1].is_empty() && pair[0] >= pair[1] {
            report.push(Violation::PackNames(format!(
                "names not sorted at entry {}",
                i + 1
            )));
        }
    }

    names
}
