//! Backing-array reuse
//!
//! Retired buffers can hand their per-element arrays back to a [`BufferPool`];
//! a buffer of the same shape activated later takes them instead of
//! allocating. Arrays are keyed by length, so only matching shapes share.

use std::collections::HashMap;

use crate::buffer::{ErrorStatus, WriteSnapshot};

/// Free lists of owned arrays, keyed by length
#[derive(Debug)]
pub struct ArrayPool<T> {
    free: HashMap<usize, Vec<Vec<T>>>,
}

impl<T: Clone> ArrayPool<T> {
    pub fn new() -> Self {
        Self {
            free: HashMap::new(),
        }
    }

    /// Pop an array of exactly `len` elements, or allocate one filled with `fill`
    ///
    /// Reused arrays keep their previous contents; callers reinitialize what
    /// they depend on.
    pub fn take(&mut self, len: usize, fill: T) -> Vec<T> {
        match self.free.get_mut(&len).and_then(Vec::pop) {
            Some(array) => array,
            None => vec![fill; len],
        }
    }

    /// Push an array back for reuse
    pub fn give(&mut self, array: Vec<T>) {
        self.free.entry(array.len()).or_default().push(array);
    }

    /// Number of cached arrays of length `len`
    pub fn available(&self, len: usize) -> usize {
        self.free.get(&len).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.free.values().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        self.free.clear();
    }
}

impl<T: Clone> Default for ArrayPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// All arrays a buffer borrows while it is active
#[derive(Debug, Default)]
pub struct BufferPool {
    /// Per-element [`ErrorStatus`], keyed by element count
    pub statuses: ArrayPool<ErrorStatus>,
    /// Read backup bytes, keyed by `element_count * backup_bytes`
    pub read_backups: ArrayPool<u8>,
    /// Write-time rate snapshots, keyed by element count
    pub write_snapshots: ArrayPool<WriteSnapshot>,
    /// Last passive-charge period, keyed by element count
    pub last_access: ArrayPool<u64>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
            && self.read_backups.is_empty()
            && self.write_snapshots.is_empty()
            && self.last_access.is_empty()
    }

    /// Drop every cached array
    pub fn clear(&mut self) {
        self.statuses.clear();
        self.read_backups.clear();
        self.write_snapshots.clear();
        self.last_access.clear();
    }
}
