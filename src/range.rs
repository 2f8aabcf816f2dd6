//! Byte ranges
//!
//! Half-open `[start, end)` address intervals used to identify approximate buffers.

use serde::{Deserialize, Serialize};

use crate::ApproxError;

/// Half-open byte interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    start: u64,
    end: u64,
}

impl Range {
    /// Create a range, rejecting `start > end`
    pub fn new(start: u64, end: u64) -> Result<Self, ApproxError> {
        if start > end {
            return Err(ApproxError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Create a range from a start address and a length in bytes
    pub fn with_len(start: u64, len: u64) -> Result<Self, ApproxError> {
        let end = start
            .checked_add(len)
            .ok_or(ApproxError::InvalidRange { start, end: u64::MAX })?;
        Self::new(start, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True iff the two ranges share at least one byte
    pub fn intersects(&self, other: &Range) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    /// True iff `other` lies entirely inside this range
    pub fn contains_range(&self, other: &Range) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Offset of `address` from the start of the range, if inside
    pub fn offset_of(&self, address: u64) -> Option<usize> {
        self.contains(address).then(|| (address - self.start) as usize)
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}
