//! Passive decay
//!
//! Data sitting in unreliable memory decays even when nobody touches it. For
//! the per-bit injectors every element remembers up to which period it has
//! been charged; the next read (or the retire flush) injects the rate
//! accumulated since then in one step. The distance model instead walks the
//! whole buffer with its Passive record once, as each period closes.

use crate::ber::ErrorCategory;
use crate::pool::BufferPool;

use super::BufferCore;

impl BufferCore {
    fn uses_element_marks(&self) -> bool {
        self.passive && !self.is_distance()
    }

    /// Take the per-element marks for a new active interval
    pub(crate) fn acquire_marks(&mut self, pool: &mut BufferPool) {
        let period = self.current_period;
        if !self.uses_element_marks() {
            return;
        }

        let mut marks = pool.last_access.take(self.element_count, period);
        marks.fill(period);
        self.last_access = marks;
    }

    pub(crate) fn release_marks(&mut self, pool: &mut BufferPool, give_away: bool) {
        let marks = std::mem::take(&mut self.last_access);
        if give_away && !marks.is_empty() {
            pool.last_access.give(marks);
        }
    }

    /// A write replaces the decayed data, so charging restarts now
    pub(crate) fn touch(&mut self, offset: usize) {
        let period = self.current_period;
        if let Some(mark) = self.last_access.get_mut(offset / self.element_size) {
            *mark = period;
        }
    }

    /// Inject the decay the element at `offset` accrued since its mark
    pub(crate) fn charge_passive(&mut self, mem: &mut [u8], offset: usize) {
        let element = offset / self.element_size;
        let current = self.current_period;
        let Some(mark) = self.last_access.get_mut(element) else {
            return;
        };
        let past = *mark;
        if past >= current {
            return;
        }
        *mark = current;

        if !self.ber.should_inject(ErrorCategory::Passive) {
            return;
        }
        let rate = self
            .ber
            .accumulated_rate(ErrorCategory::Passive, past, current);
        if rate.is_disabled() {
            return;
        }

        let log = self.log.fault_counts_mut(ErrorCategory::Passive);
        if self.overcharge {
            self.injector.inject_overcharged(mem, offset, &rate, log);
        } else {
            self.injector.inject(mem, offset, &rate, None, log);
        }
    }

    /// Walk the whole buffer with the distance model's Passive record
    ///
    /// Runs once as each period closes.
    pub(crate) fn walk_passive(&mut self, mem: &mut [u8]) {
        if !self.passive || !self.is_distance() {
            return;
        }
        if !self.ber.should_inject(ErrorCategory::Passive) {
            return;
        }

        let len = self.element_count * self.element_size;
        let index = self.ber.period_index();
        let log = self.log.fault_counts_mut(ErrorCategory::Passive);
        self.injector
            .inject_distance(mem, 0, len, ErrorCategory::Passive, index, None, log);
    }

    /// Settle all passive decay before the buffer goes inactive
    ///
    /// The distance model has nothing left to charge: its walk for the running
    /// period happens when that period closes.
    pub(crate) fn flush_passive(&mut self, mem: &mut [u8]) {
        for element in 0..self.element_count {
            self.charge_passive(mem, element * self.element_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ber::{ErrorCategory, ErrorRate};
    use crate::buffer::tests::{buffer, engine};
    use crate::config::{BufferKind, EngineConfig, InjectorConfiguration, InjectorKind};
    use crate::period_log::AccessType;
    use crate::pool::BufferPool;

    fn passive_engine(buffer: BufferKind) -> EngineConfig {
        EngineConfig {
            passive_injection: true,
            ..engine(buffer)
        }
    }

    fn passive_only(rate: ErrorRate) -> InjectorConfiguration {
        InjectorConfiguration::new(0, ErrorRate::ZERO, ErrorRate::ZERO, rate)
    }

    #[test]
    fn test_accumulated_decay_charged_on_read() {
        for kind in [BufferKind::ShortTerm, BufferKind::LongTerm] {
            let mut pool = BufferPool::new();
            let config = passive_only(ErrorRate::Probability(0.25));
            let mut buf = buffer(&passive_engine(kind), &config, 4, 1, &mut pool);
            let mut mem = [0u8; 4];

            buf.next_period(Some(&mut mem), 4);
            assert_eq!(mem, [0; 4], "{kind:?} decay is charged lazily");

            // Four periods at 0.25 add up to one full flip of every bit.
            buf.access(&mut mem, 0x1000, 1, AccessType::Read, true);
            assert_eq!(mem, [0xff, 0, 0, 0], "{kind:?}");

            let log = buf.current_log().unwrap();
            assert_eq!(log.fault_counts(ErrorCategory::Passive).unwrap(), &[1; 8]);
        }
    }

    #[test]
    fn test_write_restarts_decay() {
        let mut pool = BufferPool::new();
        let config = passive_only(ErrorRate::Probability(0.25));
        let mut buf = buffer(&passive_engine(BufferKind::LongTerm), &config, 2, 1, &mut pool);
        let mut mem = [0u8; 2];

        buf.next_period(Some(&mut mem), 4);
        buf.access(&mut mem, 0x1001, 1, AccessType::Write, true);
        buf.access(&mut mem, 0x1001, 1, AccessType::Read, true);
        assert_eq!(mem, [0, 0]);
    }

    #[test]
    fn test_even_overcharge_cancels_out() {
        let mut pool = BufferPool::new();
        let config = passive_only(ErrorRate::Probability(0.5));
        let mut buf = buffer(&passive_engine(BufferKind::ShortTerm), &config, 1, 1, &mut pool);
        let mut mem = [0x3cu8];

        buf.next_period(Some(&mut mem), 4);
        buf.access(&mut mem, 0x1000, 1, AccessType::Read, true);
        assert_eq!(mem, [0x3c]);
        let log = buf.current_log().unwrap();
        assert_eq!(log.total_faults(ErrorCategory::Passive), 16);
    }

    #[test]
    fn test_retire_charges_untouched_elements() {
        let mut pool = BufferPool::new();
        let config = passive_only(ErrorRate::Probability(0.25));
        let mut buf = buffer(&passive_engine(BufferKind::ShortTerm), &config, 3, 1, &mut pool);
        let mut mem = [0u8; 3];

        buf.next_period(Some(&mut mem), 4);
        assert!(buf.retire(Some(&mut mem), &mut pool, true));
        assert_eq!(mem, [0xff; 3]);
    }

    #[test]
    fn test_distance_walk_once_per_period() {
        let mut pool = BufferPool::new();
        let off = ErrorRate::Distance { mean: 0.0, std_dev: 0.0 };
        let config = InjectorConfiguration::new(
            0,
            off.clone(),
            off,
            ErrorRate::Distance { mean: 16.0, std_dev: 0.0 },
        );
        let engine = EngineConfig {
            injector: InjectorKind::DistanceBased,
            ..passive_engine(BufferKind::LongTerm)
        };
        let mut buf = buffer(&engine, &config, 8, 1, &mut pool);
        let mut mem = [0u8; 8];

        buf.next_period(Some(&mut mem), 1);
        assert_eq!(mem, [0, 0, 1, 0, 1, 0, 1, 0]);
        let closed = &buf.archived_logs()[&0];
        assert_eq!(closed.fault_counts(ErrorCategory::Passive).unwrap()[0], 3);

        // Reads never charge the distance model's passive decay.
        buf.access(&mut mem, 0x1000, 8, AccessType::Read, true);
        assert_eq!(mem, [0, 0, 1, 0, 1, 0, 1, 0]);

        // Decay is charged as a period closes, so retiring inside period 1 adds none.
        assert!(buf.retire(Some(&mut mem), &mut pool, true));
        assert_eq!(mem, [0, 0, 1, 0, 1, 0, 1, 0]);
        assert_eq!(buf.archived_logs()[&1].total_faults(ErrorCategory::Passive), 0);
    }
}
