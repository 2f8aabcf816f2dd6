//! Lazy materialization
//!
//! Faults decided at write time are parked in an address-ordered map and only
//! land in memory when the element is next read (or at retire). Read faults
//! corrupt memory immediately, with the original bytes parked in a second map
//! until the next access of that element. An element is never in both maps.

use std::collections::BTreeMap;

use crate::injector::BackupTarget;
use crate::pool::BufferPool;

use super::{BufferCore, Materializer, PendingCounts, WriteSnapshot};

#[derive(Debug, Clone, Default)]
pub struct ShortTermState {
    pending_writes: BTreeMap<usize, WriteSnapshot>,
    remaining_reads: BTreeMap<usize, Box<[u8]>>,
}

impl ShortTermState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets with a write fault waiting for the next read
    pub fn pending_writes(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending_writes.keys().copied()
    }

    /// Offsets currently holding read-corrupted data
    pub fn remaining_reads(&self) -> impl Iterator<Item = usize> + '_ {
        self.remaining_reads.keys().copied()
    }

    fn restore(&mut self, mem: &mut [u8], offset: usize) {
        if let Some(original) = self.remaining_reads.remove(&offset) {
            mem[offset..offset + original.len()].copy_from_slice(&original);
        }
    }
}

impl BackupTarget for ShortTermState {
    fn backup_read_data(&mut self, offset: usize, original: &[u8]) {
        self.remaining_reads
            .entry(offset)
            .or_insert_with(|| original.into());
    }
}

/// Remove and return the entries keyed inside `[start, end)`
fn drain_range<V>(map: &mut BTreeMap<usize, V>, start: usize, end: usize) -> Vec<(usize, V)> {
    let keys: Vec<usize> = map.range(start..end).map(|(&key, _)| key).collect();
    keys.into_iter()
        .filter_map(|key| map.remove(&key).map(|value| (key, value)))
        .collect()
}

impl Materializer for ShortTermState {
    fn write_element(&mut self, core: &mut BufferCore, _mem: &mut [u8], offset: usize, inject: bool) {
        // The write supersedes whatever the read left behind.
        self.remaining_reads.remove(&offset);
        core.touch(offset);

        if core.write_due(inject) {
            self.pending_writes.insert(offset, core.snapshot());
        } else {
            self.pending_writes.remove(&offset);
        }
    }

    fn read_element(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, inject: bool) {
        self.restore(mem, offset);
        if let Some(snapshot) = self.pending_writes.remove(&offset) {
            core.apply_write_fault(mem, offset, snapshot);
        }
        core.charge_passive(mem, offset);

        if core.read_due(inject) {
            let len = core.element_size;
            core.inject_read_element(mem, offset, self);
            core.inject_read_span(mem, offset, len, self);
        }
    }

    fn write_run(&mut self, core: &mut BufferCore, _mem: &mut [u8], offset: usize, len: usize, inject: bool) {
        let end = offset + len;
        drain_range(&mut self.remaining_reads, offset, end);

        let due = core.write_due(inject);
        if !due {
            drain_range(&mut self.pending_writes, offset, end);
        }

        let snapshot = core.snapshot();
        for element in (offset..end).step_by(core.element_size) {
            core.touch(element);
            if due {
                self.pending_writes.insert(element, snapshot);
            }
        }
    }

    fn read_run(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, len: usize, inject: bool) {
        let end = offset + len;
        for (element, original) in drain_range(&mut self.remaining_reads, offset, end) {
            mem[element..element + original.len()].copy_from_slice(&original);
        }
        for (element, snapshot) in drain_range(&mut self.pending_writes, offset, end) {
            core.apply_write_fault(mem, element, snapshot);
        }

        let due = core.read_due(inject);
        for element in (offset..end).step_by(core.element_size) {
            core.charge_passive(mem, element);
            if due {
                core.inject_read_element(mem, element, self);
            }
        }
        if due {
            core.inject_read_span(mem, offset, len, self);
        }
    }

    fn flush(&mut self, core: &mut BufferCore, mem: &mut [u8]) {
        for (offset, original) in std::mem::take(&mut self.remaining_reads) {
            mem[offset..offset + original.len()].copy_from_slice(&original);
        }
        for (offset, snapshot) in std::mem::take(&mut self.pending_writes) {
            core.apply_write_fault(mem, offset, snapshot);
        }
    }

    fn acquire(&mut self, _core: &BufferCore, _pool: &mut BufferPool) {
        self.pending_writes.clear();
        self.remaining_reads.clear();
    }

    fn release(&mut self, _pool: &mut BufferPool, _give_away: bool) {
        self.pending_writes.clear();
        self.remaining_reads.clear();
    }

    fn pending(&self) -> PendingCounts {
        PendingCounts {
            pending_reads: self.remaining_reads.len(),
            pending_writes: self.pending_writes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ber::{ErrorCategory, ErrorRate};
    use crate::buffer::tests::{buffer, engine, CERTAIN};
    use crate::buffer::{Materialization, PendingCounts};
    use crate::config::{BufferKind, InjectorConfiguration};
    use crate::period_log::AccessType;
    use crate::pool::BufferPool;

    fn config(read: f64, write: f64) -> InjectorConfiguration {
        InjectorConfiguration::new(
            0,
            ErrorRate::Probability(read),
            ErrorRate::Probability(write),
            ErrorRate::ZERO,
        )
    }

    #[test]
    fn test_retire_applies_each_pending_write_once() {
        let mut pool = BufferPool::new();
        let mut buf = buffer(&engine(BufferKind::ShortTerm), &config(0.0, CERTAIN), 16, 1, &mut pool);
        let mut mem = [0u8; 16];

        for address in (0x1000..0x1010).step_by(2) {
            buf.access(&mut mem, address, 1, AccessType::Write, true);
        }
        assert_eq!(buf.pending().pending_writes, 8);
        assert_eq!(mem, [0; 16]);

        assert!(buf.retire(Some(&mut mem), &mut pool, true));
        for (offset, byte) in mem.iter().enumerate() {
            let expected = if offset % 2 == 0 { 0xff } else { 0x00 };
            assert_eq!(*byte, expected, "offset {offset}");
        }

        let log = &buf.archived_logs()[&0];
        assert_eq!(log.fault_counts(ErrorCategory::Write).unwrap(), &[8; 8]);
    }

    #[test]
    fn test_read_fault_is_restored_by_next_read() {
        let mut pool = BufferPool::new();
        let mut buf = buffer(&engine(BufferKind::ShortTerm), &config(CERTAIN, 0.0), 4, 2, &mut pool);
        let mut mem = [0x12u8, 0x34, 0x56, 0x78];

        buf.access(&mut mem, 0x1002, 2, AccessType::Read, true);
        assert_eq!(mem, [0x12, 0x34, 0xa9, 0x78]);
        assert_eq!(
            buf.pending(),
            PendingCounts {
                pending_reads: 1,
                pending_writes: 0
            }
        );

        buf.access(&mut mem, 0x1002, 2, AccessType::Read, false);
        assert_eq!(mem, [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(buf.pending(), PendingCounts::default());
    }

    #[test]
    fn test_write_drops_read_backup() {
        let mut pool = BufferPool::new();
        let mut buf = buffer(&engine(BufferKind::ShortTerm), &config(CERTAIN, 0.0), 2, 1, &mut pool);
        let mut mem = [0x0fu8, 0];

        buf.access(&mut mem, 0x1000, 1, AccessType::Read, true);
        assert_eq!(mem[0], 0xf0);
        buf.access(&mut mem, 0x1000, 1, AccessType::Write, true);
        mem[0] = 0x42;
        assert!(buf.retire(Some(&mut mem), &mut pool, false));
        assert_eq!(mem[0], 0x42);
    }

    #[test]
    fn test_clean_write_cancels_pending_fault() {
        let mut pool = BufferPool::new();
        let mut buf = buffer(&engine(BufferKind::ShortTerm), &config(0.0, CERTAIN), 2, 1, &mut pool);
        let mut mem = [0u8; 2];

        buf.access(&mut mem, 0x1000, 1, AccessType::Write, true);
        buf.access(&mut mem, 0x1000, 1, AccessType::Write, false);
        buf.access(&mut mem, 0x1000, 1, AccessType::Read, true);
        assert_eq!(mem, [0, 0]);
    }

    #[test]
    fn test_runs_use_range_queries() {
        let mut pool = BufferPool::new();
        let mut buf = buffer(&engine(BufferKind::ShortTerm), &config(0.0, CERTAIN), 8, 2, &mut pool);
        let mut mem = [0u8; 8];

        buf.access(&mut mem, 0x1000, 8, AccessType::Write, true);
        match &buf.strategy {
            Materialization::ShortTerm(state) => {
                assert_eq!(state.pending_writes().collect::<Vec<_>>(), vec![0, 2, 4, 6]);
            }
            other => panic!("unexpected {other:?}"),
        }

        buf.access(&mut mem, 0x1002, 4, AccessType::Read, true);
        assert_eq!(mem, [0, 0, 0xff, 0, 0xff, 0, 0, 0]);
        assert_eq!(buf.pending().pending_writes, 2);
    }
}
