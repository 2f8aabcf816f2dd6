//! Per-period statistics
//!
//! A [`PeriodLog`] counts accessed bytes and, when fault logging is enabled,
//! the number of flips per bit position for each error category.

use serde::{Deserialize, Serialize};

use crate::ber::{BitErrorConfig, ErrorCategory};

/// Direction of a simulated memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Write,
}

impl AccessType {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Statistics for one buffer during one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodLog {
    pub period: u64,
    /// Accessed bytes, indexed by [`AccessType`]
    pub accessed_bytes: [u64; AccessType::COUNT],
    /// Flips per bit position, indexed by [`ErrorCategory`]
    pub fault_counts: Option<[Vec<u64>; ErrorCategory::COUNT]>,
    /// Rate sequence index active during the period, per category
    pub rate_index: [usize; ErrorCategory::COUNT],
}

impl PeriodLog {
    pub fn new(period: u64, ber: &BitErrorConfig, bit_depth: usize, log_faults: bool) -> Self {
        let fault_counts = log_faults.then(|| std::array::from_fn(|_| vec![0; bit_depth]));
        Self {
            period,
            accessed_bytes: [0; AccessType::COUNT],
            fault_counts,
            rate_index: ErrorCategory::ALL.map(|category| ber.current_index(category)),
        }
    }

    pub fn record_access(&mut self, access: AccessType, bytes: usize) {
        self.accessed_bytes[access.index()] += bytes as u64;
    }

    pub fn accessed(&self, access: AccessType) -> u64 {
        self.accessed_bytes[access.index()]
    }

    pub fn fault_counts(&self, category: ErrorCategory) -> Option<&[u64]> {
        self.fault_counts
            .as_ref()
            .map(|counts| counts[category.index()].as_slice())
    }

    pub fn fault_counts_mut(&mut self, category: ErrorCategory) -> Option<&mut [u64]> {
        self.fault_counts
            .as_mut()
            .map(|counts| counts[category.index()].as_mut_slice())
    }

    /// Total flips recorded for a category
    pub fn total_faults(&self, category: ErrorCategory) -> u64 {
        self.fault_counts(category)
            .map(|counts| counts.iter().sum())
            .unwrap_or(0)
    }

    /// True when nothing was accessed or injected during the period
    pub fn is_untouched(&self) -> bool {
        self.accessed_bytes.iter().all(|&bytes| bytes == 0)
            && ErrorCategory::ALL
                .iter()
                .all(|&category| self.total_faults(category) == 0)
    }
}
