use std::cmp::Ordering;
use std::fmt;

use bstr::{BStr, BString, ByteSlice};
use grix_hash::{HashAlgorithm, ObjectId};

use crate::ObjectError;

/// File mode of a tree or index entry, kept as the raw octal value.
///
/// Classification goes through the format bits (the high octal digits),
/// the way the kernel's `S_IS*` macros do, so unusual-but-valid modes from
/// old writers still classify instead of falling into a catch-all.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

/// Mask selecting the object-kind bits of a mode.
const KIND_MASK: u32 = 0o170000;

impl FileMode {
    pub const REGULAR: Self = Self(0o100644);
    pub const EXECUTABLE: Self = Self(0o100755);
    pub const SYMLINK: Self = Self(0o120000);
    pub const GITLINK: Self = Self(0o160000);
    pub const TREE: Self = Self(0o040000);

    /// Wrap a raw mode value as-is (round-trip safe for unusual modes).
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Parse the octal ASCII spelling used in tree objects.
    pub fn from_octal(s: &[u8]) -> Result<Self, ObjectError> {
        if s.is_empty() {
            return Err(ObjectError::InvalidFileMode("<empty>".into()));
        }
        s.iter()
            .try_fold(0u32, |acc, &b| match b {
                b'0'..=b'7' => acc.checked_mul(8)?.checked_add(u32::from(b - b'0')),
                _ => None,
            })
            .map(Self)
            .ok_or_else(|| ObjectError::InvalidFileMode(s.as_bstr().to_string()))
    }

    /// Octal ASCII spelling (canonical: no leading zero, so trees print
    /// as `40000`).
    pub fn to_octal(self) -> Vec<u8> {
        format!("{:o}", self.0).into_bytes()
    }

    /// Raw numeric value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_tree(self) -> bool {
        self.0 & KIND_MASK == 0o040000
    }

    pub const fn is_blob(self) -> bool {
        self.0 & KIND_MASK == 0o100000
    }

    pub const fn is_symlink(self) -> bool {
        self.0 & KIND_MASK == 0o120000
    }

    pub const fn is_gitlink(self) -> bool {
        self.0 & KIND_MASK == 0o160000
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMode({:06o})", self.0)
    }
}

/// A single entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: BString,
    pub oid: ObjectId,
}

impl TreeEntry {
    /// Canonical tree ordering.
    ///
    /// Directories compare as if their name carried a trailing `/`;
    /// expressed here by chaining that byte onto the name iterator, which
    /// also makes "exhausted name" and "name plus slash" fall out of the
    /// ordinary lexicographic comparison.
    pub fn canonical_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
        let tail = |is_dir: bool| if is_dir { &b"/"[..] } else { &b""[..] };
        a.name
            .iter()
            .chain(tail(a.mode.is_tree()))
            .cmp(b.name.iter().chain(tail(b.mode.is_tree())))
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::canonical_order(self, other)
    }
}

/// Streaming parser over raw tree content.
///
/// Yields entries in on-disk order; the sparse-index expander walks trees
/// through this without materializing a `Tree` when it only needs one
/// pass.
pub struct TreeIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TreeIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_until(&mut self, stop: u8, what: &'static str) -> Result<&'a [u8], ObjectError> {
        let data = self.data;
        let start = self.pos;
        match data[start..].find_byte(stop) {
            Some(len) => {
                self.pos = start + len + 1;
                Ok(&data[start..start + len])
            }
            None => Err(ObjectError::InvalidTreeEntry {
                offset: start,
                reason: format!("missing {what}"),
            }),
        }
    }

    fn take_oid(&mut self) -> Result<ObjectId, ObjectError> {
        let width = HashAlgorithm::Sha1.digest_len();
        let start = self.pos;
        if start + width > self.data.len() {
            return Err(ObjectError::InvalidTreeEntry {
                offset: start,
                reason: "truncated OID".into(),
            });
        }
        self.pos = start + width;
        Ok(ObjectId::from_bytes(
            &self.data[start..start + width],
            HashAlgorithm::Sha1,
        )?)
    }
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = Result<TreeEntry, ObjectError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let offset = self.pos;
        let parse = (|| {
            let mode = FileMode::from_octal(self.take_until(b' ', "space after mode")?)
                .map_err(|_| ObjectError::InvalidTreeEntry {
                    offset,
                    reason: "invalid mode".into(),
                })?;
            let name = BString::from(self.take_until(0, "null after name")?);
            let oid = self.take_oid()?;
            Ok(TreeEntry { mode, name, oid })
        })();
        if parse.is_err() {
            // Poison the iterator so damage is reported once.
            self.pos = self.data.len();
        }
        Some(parse)
    }
}

/// A tree object: one directory level of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse tree content: a sequence of `<mode> <name>\0<oid-bytes>`.
    pub fn parse(content: &[u8]) -> Result<Self, ObjectError> {
        let entries = TreeIter::new(content).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Serialize tree content in canonical sort order.
    pub fn serialize_content(&self) -> Vec<u8> {
        let mut order: Vec<&TreeEntry> = self.entries.iter().collect();
        order.sort_by(|a, b| TreeEntry::canonical_order(a, b));

        let mut out = Vec::new();
        for entry in order {
            out.extend_from_slice(&entry.mode.to_octal());
            out.push(b' ');
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.oid.as_bytes());
        }
        out
    }

    /// Sort entries in canonical order.
    pub fn sort(&mut self) {
        self.entries.sort();
    }

    /// Look up an entry by name.
    pub fn find(&self, name: &BStr) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name.as_bstr() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
