//! Block arithmetic and range header handling.
//!
//! A file of `total` bytes is split into `ceil(total / block_size)` blocks.
//! Every block but the last is exactly `block_size` bytes; the last one
//! covers whatever remains.

use serde::{Deserialize, Serialize};

use crate::constants::{CONNECTION_VALUE_MAX_LEN, RANGE_HEADER_MAX_LEN};

/// Errors from formatting or parsing range headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("range has zero length")]
    ZeroLength,

    #[error("range starting at {start} with length {length} overflows")]
    RangeOverflow { start: u64, length: u32 },

    #[error("Content-Range is missing the total size: {0:?}")]
    MissingTotal(String),

    #[error("Content-Range total is not a number: {0:?}")]
    InvalidTotal(String),

    #[error("Content-Range reports a zero total size")]
    ZeroTotal,

    #[error("Content-Range total saturates the size range")]
    SaturatedTotal,
}

/// A contiguous, inclusive-start byte range covering one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRange {
    pub start: u64,
    pub length: u32,
}

impl BlockRange {
    /// Computes the range for block `index` of a `total`-byte file.
    ///
    /// Returns `None` when `index` lies past the end of the file or
    /// `block_size` is zero.
    pub fn for_block(index: u32, block_size: u32, total: u64) -> Option<Self> {
        if block_size == 0 {
            return None;
        }
        let start = u64::from(index).checked_mul(u64::from(block_size))?;
        if start >= total {
            return None;
        }
        let remaining = total - start;
        let length = if remaining < u64::from(block_size) {
            // Last block: whatever is left of the file.
            remaining as u32
        } else {
            block_size
        };
        Some(Self { start, length })
    }

    /// Inclusive end offset, or `None` for a zero-length or overflowing range.
    pub fn end(&self) -> Option<u64> {
        if self.length == 0 {
            return None;
        }
        self.start.checked_add(u64::from(self.length) - 1)
    }
}

/// Number of blocks needed to cover `total` bytes.
pub fn block_count(total: u64, block_size: u32) -> u64 {
    if block_size == 0 {
        return 0;
    }
    total.div_ceil(u64::from(block_size))
}

/// Formats `range` as a `Range` header value: `bytes=<start>-<end>`.
pub fn format_range_header(range: &BlockRange) -> Result<String, ProtocolError> {
    if range.length == 0 {
        return Err(ProtocolError::ZeroLength);
    }
    let end = range.end().ok_or(ProtocolError::RangeOverflow {
        start: range.start,
        length: range.length,
    })?;
    let value = format!("bytes={}-{}", range.start, end);
    debug_assert!(value.len() <= RANGE_HEADER_MAX_LEN);
    Ok(value)
}

/// Extracts the total object size from a `Content-Range` value of the form
/// `bytes <start>-<end>/<total>`.
pub fn parse_content_range_total(value: &str) -> Result<u64, ProtocolError> {
    let (_, total) = value
        .rsplit_once('/')
        .ok_or_else(|| ProtocolError::MissingTotal(value.to_string()))?;
    let total = total.trim();
    if total.is_empty() || total == "*" {
        return Err(ProtocolError::MissingTotal(value.to_string()));
    }

    let size = match total.parse::<u64>() {
        Ok(size) => size,
        Err(e) if *e.kind() == std::num::IntErrorKind::PosOverflow => {
            return Err(ProtocolError::SaturatedTotal);
        }
        Err(_) => return Err(ProtocolError::InvalidTotal(total.to_string())),
    };

    match size {
        0 => Err(ProtocolError::ZeroTotal),
        u64::MAX => Err(ProtocolError::SaturatedTotal),
        size => Ok(size),
    }
}

/// Returns `true` if a `Connection` header value announces that the peer
/// will close the connection after this response.
pub fn connection_will_close(value: Option<&str>) -> bool {
    match value {
        Some(v) if v.len() <= CONNECTION_VALUE_MAX_LEN => v.trim().eq_ignore_ascii_case("close"),
        _ => false,
    }
}
