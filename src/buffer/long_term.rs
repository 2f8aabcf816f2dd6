//! Eager per-element materialization
//!
//! Every element owns one [`ErrorStatus`], one read-backup slot and one write
//! snapshot, all in flat arrays borrowed from the [`BufferPool`] while the
//! buffer is active. Accesses cost O(1) per element; activate and retire cost
//! O(element count).

use crate::injector::BackupTarget;
use crate::pool::BufferPool;

use super::{BufferCore, ErrorStatus, Materializer, PendingCounts, WriteSnapshot};

#[derive(Debug, Clone)]
pub struct LongTermState {
    element_size: usize,
    backup_bytes: usize,
    statuses: Vec<ErrorStatus>,
    read_backups: Vec<u8>,
    write_snapshots: Vec<WriteSnapshot>,
}

impl LongTermState {
    pub fn new(element_size: usize, backup_bytes: usize) -> Self {
        Self {
            element_size,
            backup_bytes,
            statuses: Vec::new(),
            read_backups: Vec::new(),
            write_snapshots: Vec::new(),
        }
    }

    pub fn status(&self, element: usize) -> Option<ErrorStatus> {
        self.statuses.get(element).copied()
    }

    fn backup_slot(&mut self, element: usize) -> &mut [u8] {
        let start = element * self.backup_bytes;
        &mut self.read_backups[start..start + self.backup_bytes]
    }
}

impl BackupTarget for LongTermState {
    fn backup_read_data(&mut self, offset: usize, original: &[u8]) {
        let element = offset / self.element_size;
        let len = original.len().min(self.backup_bytes);
        self.backup_slot(element)[..len].copy_from_slice(&original[..len]);
        self.statuses[element] = ErrorStatus::PendingRead;
    }
}

impl Materializer for LongTermState {
    fn write_element(&mut self, core: &mut BufferCore, _mem: &mut [u8], offset: usize, inject: bool) {
        let element = offset / self.element_size;
        self.statuses[element] = if core.write_due(inject) {
            ErrorStatus::PendingWrite
        } else {
            ErrorStatus::None
        };
        self.write_snapshots[element] = core.snapshot();
        core.touch(offset);
    }

    fn read_element(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, inject: bool) {
        self.settle(core, mem, offset, inject);

        if core.read_due(inject) {
            let len = self.element_size;
            core.inject_read_span(mem, offset, len, self);
        }
    }

    fn read_run(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, len: usize, inject: bool) {
        for element in (offset..offset + len).step_by(self.element_size) {
            self.settle(core, mem, element, inject);
        }

        if core.read_due(inject) {
            core.inject_read_span(mem, offset, len, self);
        }
    }

    fn flush(&mut self, core: &mut BufferCore, mem: &mut [u8]) {
        for element in 0..self.statuses.len() {
            self.settle(core, mem, element * self.element_size, false);
        }
    }

    fn acquire(&mut self, core: &BufferCore, pool: &mut BufferPool) {
        let count = core.element_count;

        let mut statuses = pool.statuses.take(count, ErrorStatus::None);
        statuses.fill(ErrorStatus::None);
        self.statuses = statuses;

        self.read_backups = pool.read_backups.take(count * self.backup_bytes, 0);

        let mut snapshots = pool.write_snapshots.take(count, WriteSnapshot::default());
        snapshots.fill(WriteSnapshot::default());
        self.write_snapshots = snapshots;
    }

    fn release(&mut self, pool: &mut BufferPool, give_away: bool) {
        let statuses = std::mem::take(&mut self.statuses);
        let read_backups = std::mem::take(&mut self.read_backups);
        let write_snapshots = std::mem::take(&mut self.write_snapshots);

        if give_away {
            pool.statuses.give(statuses);
            pool.read_backups.give(read_backups);
            pool.write_snapshots.give(write_snapshots);
        }
    }

    fn pending(&self) -> PendingCounts {
        self.statuses
            .iter()
            .fold(PendingCounts::default(), |mut counts, status| {
                match status {
                    ErrorStatus::PendingRead => counts.pending_reads += 1,
                    ErrorStatus::PendingWrite => counts.pending_writes += 1,
                    ErrorStatus::None => {}
                }
                counts
            })
    }
}

impl LongTermState {
    /// Resolve the element's pending state, charge decay, then maybe inject a
    /// fresh per-bit read fault
    fn settle(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, inject: bool) {
        let element = offset / self.element_size;
        match self.statuses[element] {
            ErrorStatus::PendingRead => {
                let len = self.backup_bytes;
                mem[offset..offset + len].copy_from_slice(self.backup_slot(element));
            }
            ErrorStatus::PendingWrite => {
                core.apply_write_fault(mem, offset, self.write_snapshots[element]);
            }
            ErrorStatus::None => {}
        }
        self.statuses[element] = ErrorStatus::None;

        core.charge_passive(mem, offset);

        if core.read_due(inject) {
            core.inject_read_element(mem, offset, self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::{ErrorCategory, ErrorRate};
    use crate::buffer::tests::{buffer, engine, CERTAIN};
    use crate::buffer::{ApproximateBuffer, Materialization};
    use crate::config::{BufferKind, EngineConfig, InjectorConfiguration, InjectorKind};
    use crate::period_log::AccessType;

    fn state(buf: &ApproximateBuffer) -> &LongTermState {
        match &buf.strategy {
            Materialization::LongTerm(state) => state,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_rate_survives_rotation_to_zero() {
        let mut pool = BufferPool::new();
        let mut config = InjectorConfiguration::new(0, ErrorRate::ZERO, ErrorRate::ZERO, ErrorRate::ZERO);
        config.write = vec![ErrorRate::Probability(CERTAIN), ErrorRate::ZERO];
        let mut buf = buffer(&engine(BufferKind::LongTerm), &config, 4, 1, &mut pool);
        let mut mem = [0u8; 4];

        buf.access(&mut mem, 0x1001, 1, AccessType::Write, true);
        assert_eq!(state(&buf).status(1), Some(ErrorStatus::PendingWrite));

        buf.next_period(Some(&mut mem), 1);
        assert!(!buf.ber().should_inject(ErrorCategory::Write));

        buf.access(&mut mem, 0x1001, 1, AccessType::Read, true);
        assert_eq!(mem, [0, 0xff, 0, 0]);
        assert_eq!(state(&buf).status(1), Some(ErrorStatus::None));
    }

    #[test]
    fn test_read_backup_restored_on_next_read() {
        let mut pool = BufferPool::new();
        let config = InjectorConfiguration::new(
            0,
            ErrorRate::Probability(CERTAIN),
            ErrorRate::ZERO,
            ErrorRate::ZERO,
        )
        .with_bit_depth(12);
        let mut buf = buffer(&engine(BufferKind::LongTerm), &config, 4, 2, &mut pool);
        let mut mem = [0x00u8, 0x00, 0xaa, 0xf0];

        buf.access(&mut mem, 0x1002, 2, AccessType::Read, true);
        assert_eq!(mem, [0x00, 0x00, 0x55, 0xff]);
        assert_eq!(state(&buf).status(1), Some(ErrorStatus::PendingRead));

        buf.access(&mut mem, 0x1002, 2, AccessType::Read, false);
        assert_eq!(mem, [0x00, 0x00, 0xaa, 0xf0]);
    }

    #[test]
    fn test_retire_flushes_without_new_faults() {
        let mut pool = BufferPool::new();
        let config = InjectorConfiguration::new(
            0,
            ErrorRate::Probability(CERTAIN),
            ErrorRate::Probability(CERTAIN),
            ErrorRate::ZERO,
        );
        let mut buf = buffer(&engine(BufferKind::LongTerm), &config, 3, 1, &mut pool);
        let mut mem = [0x11u8, 0x22, 0x33];

        buf.access(&mut mem, 0x1000, 1, AccessType::Write, true);
        buf.access(&mut mem, 0x1001, 1, AccessType::Read, true);
        assert_eq!(mem, [0x11, 0xdd, 0x33]);

        assert!(buf.retire(Some(&mut mem), &mut pool, true));
        assert_eq!(mem, [0xee, 0x22, 0x33]);
    }

    #[test]
    fn test_pool_round_trip_reuses_arrays() {
        let mut pool = BufferPool::new();
        let config = InjectorConfiguration::new(0, ErrorRate::ZERO, ErrorRate::ZERO, ErrorRate::ZERO);
        let engine = engine(BufferKind::LongTerm);
        let mut mem = [0u8; 32];

        let mut first = buffer(&engine, &config, 32, 4, &mut pool);
        let statuses = state(&first).statuses.as_ptr();
        let backups = state(&first).read_backups.as_ptr();
        assert!(first.retire(Some(&mut mem), &mut pool, true));
        assert_eq!(pool.statuses.available(8), 1);

        let mut second = buffer(&engine, &config, 32, 4, &mut pool);
        assert_eq!(state(&second).statuses.as_ptr(), statuses);
        assert_eq!(state(&second).read_backups.as_ptr(), backups);
        assert!(pool.statuses.available(8) == 0);

        assert!(second.retire(Some(&mut mem), &mut pool, false));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_distance_read_runs_over_whole_access() {
        let mut pool = BufferPool::new();
        let off = ErrorRate::Distance { mean: 0.0, std_dev: 0.0 };
        let config = InjectorConfiguration::new(
            0,
            ErrorRate::Distance { mean: 16.0, std_dev: 0.0 },
            off.clone(),
            off,
        );
        let engine = EngineConfig {
            injector: InjectorKind::DistanceBased,
            ..engine(BufferKind::LongTerm)
        };
        let mut buf = buffer(&engine, &config, 8, 1, &mut pool);
        let mut mem = [0u8; 8];

        buf.access(&mut mem, 0x1000, 8, AccessType::Read, true);
        assert_eq!(mem, [0, 0, 1, 0, 1, 0, 1, 0]);
        assert_eq!(buf.pending().pending_reads, 3);

        assert!(buf.retire(Some(&mut mem), &mut pool, true));
        assert_eq!(mem, [0; 8]);
    }
}
