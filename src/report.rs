//! End-of-run summaries
//!
//! Reports are plain serializable snapshots of the engine; rendering them is
//! left to `serde_json`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::ber::ErrorCategory;
use crate::buffer::{ApproximateBuffer, BufferKey, PendingCounts};
use crate::config::{BufferKind, EngineConfig, InjectorKind};
use crate::energy::{period_energy, ConsumptionProfile, PeriodEnergy};
use crate::period_log::{AccessType, PeriodLog};
use crate::ApproxError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryTotals {
    pub read: u64,
    pub write: u64,
    pub passive: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferReport {
    pub key: BufferKey,
    pub bit_depth: usize,
    pub element_count: usize,
    pub active: bool,
    pub activations: u32,
    pub creation_period: u64,
    pub pending: PendingCounts,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub faults: CategoryTotals,
    /// Archived logs followed by the running one, if active
    pub periods: Vec<PeriodLog>,
    pub energy: Option<PeriodEnergy>,
}

impl BufferReport {
    pub fn new(buffer: &ApproximateBuffer, profile: Option<&ConsumptionProfile>, passive: bool) -> Self {
        let key = *buffer.key();
        let periods: Vec<PeriodLog> = buffer
            .archived_logs()
            .values()
            .chain(buffer.current_log())
            .cloned()
            .collect();

        let total = |category: ErrorCategory| periods.iter().map(|log| log.total_faults(category)).sum();
        let faults = CategoryTotals {
            read: total(ErrorCategory::Read),
            write: total(ErrorCategory::Write),
            passive: total(ErrorCategory::Passive),
        };

        let energy = profile.map(|profile| {
            let mut sum = PeriodEnergy::default();
            for log in &periods {
                sum.accumulate(&period_energy(
                    log,
                    profile,
                    buffer.bit_depth(),
                    key.element_size,
                    key.range.size(),
                    passive,
                ));
            }
            sum
        });

        Self {
            key,
            bit_depth: buffer.bit_depth(),
            element_count: buffer.element_count(),
            active: buffer.is_active(),
            activations: buffer.activations(),
            creation_period: buffer.creation_period(),
            pending: buffer.pending(),
            bytes_read: periods.iter().map(|log| log.accessed(AccessType::Read)).sum(),
            bytes_written: periods.iter().map(|log| log.accessed(AccessType::Write)).sum(),
            faults,
            periods,
            energy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineReport {
    pub period: u64,
    pub injector: InjectorKind,
    pub buffer: BufferKind,
    pub passive_injection: bool,
    pub buffers: Vec<BufferReport>,
}

impl EngineReport {
    pub fn new<'a>(
        period: u64,
        config: &EngineConfig,
        buffers: impl IntoIterator<Item = &'a ApproximateBuffer>,
        consumption: &BTreeMap<i64, ConsumptionProfile>,
    ) -> Self {
        let buffers = buffers
            .into_iter()
            .map(|buffer| {
                let profile = consumption.get(&buffer.key().config_id);
                BufferReport::new(buffer, profile, config.passive_injection)
            })
            .collect();

        Self {
            period,
            injector: config.injector,
            buffer: config.buffer,
            passive_injection: config.passive_injection,
            buffers,
        }
    }

    pub fn total_faults(&self) -> CategoryTotals {
        self.buffers
            .iter()
            .fold(CategoryTotals::default(), |mut acc, buffer| {
                acc.read += buffer.faults.read;
                acc.write += buffer.faults.write;
                acc.passive += buffer.faults.passive;
                acc
            })
    }

    pub fn to_json_pretty(&self) -> Result<String, ApproxError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::ErrorRate;
    use crate::buffer::tests::{buffer, engine, CERTAIN};
    use crate::config::InjectorConfiguration;
    use crate::energy::CategoryValues;
    use crate::pool::BufferPool;

    #[test]
    fn test_report_sums_periods_and_energy() {
        let mut pool = BufferPool::new();
        let config = InjectorConfiguration::new(
            0,
            ErrorRate::ZERO,
            ErrorRate::Probability(CERTAIN),
            ErrorRate::ZERO,
        );
        let engine_config = engine(BufferKind::LongTerm);
        let mut buf = buffer(&engine_config, &config, 4, 1, &mut pool);
        let mut mem = [0u8; 4];

        buf.access(&mut mem, 0x1000, 1, crate::period_log::AccessType::Write, true);
        buf.next_period(Some(&mut mem), 1);
        buf.access(&mut mem, 0x1000, 2, crate::period_log::AccessType::Read, true);

        let profile = ConsumptionProfile {
            configuration_id: 0,
            reference: None,
            approximate: CategoryValues {
                read: vec![1.0],
                write: vec![3.0],
                passive: vec![],
            },
        };
        let mut consumption = BTreeMap::new();
        consumption.insert(0, profile);

        let report = EngineReport::new(1, &engine_config, [&buf], &consumption);
        let only = &report.buffers[0];
        assert_eq!(only.periods.len(), 2);
        assert_eq!(only.bytes_read, 2);
        assert_eq!(only.bytes_written, 1);
        assert_eq!(only.faults.write, 8);
        let energy = only.energy.unwrap();
        assert_eq!(energy.read.approximate, 2.0);
        assert_eq!(energy.write.approximate, 3.0);
        assert_eq!(energy.read.reference, None);

        let json = report.to_json_pretty().unwrap();
        assert!(json.contains("\"bytes_written\": 1"));
        assert_eq!(report.total_faults().write, 8);
    }
}
