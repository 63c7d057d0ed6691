//! The `"<type> <size>\0"` object header codec.

use bstr::ByteSlice;

use crate::{ObjectError, ObjectType};

/// A decoded object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: ObjectType,
    /// Declared content size in bytes.
    pub content_len: usize,
    /// Bytes the header occupies, null terminator included.
    pub header_len: usize,
}

impl ObjectHeader {
    /// Decode the header at the front of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, ObjectError> {
        let terminator = data
            .find_byte(0)
            .ok_or_else(|| ObjectError::InvalidHeader("missing null terminator".into()))?;
        let (kind, size) = data[..terminator]
            .split_once_str(" ")
            .ok_or_else(|| ObjectError::InvalidHeader("missing space in header".into()))?;

        Ok(Self {
            kind: ObjectType::from_bytes(kind)?,
            content_len: decimal(size).ok_or_else(|| {
                ObjectError::InvalidHeader(format!("invalid size: {}", size.as_bstr()))
            })?,
            header_len: terminator + 1,
        })
    }

    /// Encode a header for an object of `kind` with `content_len` bytes.
    pub fn encode(kind: ObjectType, content_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(kind.as_bytes().len() + 22);
        out.extend_from_slice(kind.as_bytes());
        out.push(b' ');
        out.extend_from_slice(content_len.to_string().as_bytes());
        out.push(0);
        out
    }
}

/// Fold ASCII digits into a usize, rejecting empty input, stray bytes,
/// and overflow.
fn decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0usize, |acc, &b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(usize::from(b - b'0'))
    })
}
