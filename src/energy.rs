//! Energy estimation
//!
//! A linear model on top of the byte counters of a [`PeriodLog`]: each
//! configuration id may carry per-category energy values in pJ per byte of
//! implemented storage, one value per rate in the rotation. Passive energy is
//! charged for the whole buffer once per period.

use serde::{Deserialize, Serialize};

use crate::ber::ErrorCategory;
use crate::period_log::{AccessType, PeriodLog};
use crate::ApproxError;

/// Which memory the estimate is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionType {
    /// Reliable memory the approximate one replaces
    Reference,
    Approximate,
}

/// Energy values per category, indexed by rate rotation index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryValues {
    pub read: Vec<f64>,
    pub write: Vec<f64>,
    pub passive: Vec<f64>,
}

impl CategoryValues {
    pub fn get(&self, category: ErrorCategory) -> &[f64] {
        match category {
            ErrorCategory::Read => &self.read,
            ErrorCategory::Write => &self.write,
            ErrorCategory::Passive => &self.passive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionProfile {
    pub configuration_id: i64,
    #[serde(default)]
    pub reference: Option<CategoryValues>,
    #[serde(default)]
    pub approximate: CategoryValues,
}

impl ConsumptionProfile {
    pub fn validate(&self) -> Result<(), ApproxError> {
        let groups = [Some(&self.approximate), self.reference.as_ref()];
        for values in groups.into_iter().flatten() {
            for category in ErrorCategory::ALL {
                if let Some(v) = values.get(category).iter().find(|v| !v.is_finite() || **v < 0.0) {
                    return Err(ApproxError::InvalidConfig(format!(
                        "consumption profile {}: {category} energy {v} must be finite and non-negative",
                        self.configuration_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn values(&self, kind: ConsumptionType) -> Option<&CategoryValues> {
        match kind {
            ConsumptionType::Reference => self.reference.as_ref(),
            ConsumptionType::Approximate => Some(&self.approximate),
        }
    }

    /// Energy for `processed_bytes` of `element_size` byte elements with
    /// `bit_depth` implemented bits
    ///
    /// `None` when the profile has no value for the category.
    pub fn estimate(
        &self,
        processed_bytes: u64,
        bit_depth: usize,
        element_size: usize,
        kind: ConsumptionType,
        category: ErrorCategory,
        rate_index: usize,
    ) -> Option<f64> {
        let values = self.values(kind)?.get(category);
        if values.is_empty() || element_size == 0 {
            return None;
        }
        let value = values[rate_index % values.len()];
        let elements = processed_bytes as f64 / element_size as f64;
        Some(elements * bit_depth as f64 / 8.0 * value)
    }
}

/// Approximate and reference energy of one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Energy {
    pub approximate: f64,
    pub reference: Option<f64>,
}

impl Energy {
    fn add(&mut self, other: Energy) {
        self.approximate += other.approximate;
        self.reference = match (self.reference, other.reference) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

/// Energy of one period, per category
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PeriodEnergy {
    pub read: Energy,
    pub write: Energy,
    pub passive: Energy,
}

impl PeriodEnergy {
    pub fn total(&self) -> Energy {
        let mut total = Energy::default();
        total.add(self.read);
        total.add(self.write);
        total.add(self.passive);
        total
    }

    pub fn accumulate(&mut self, other: &PeriodEnergy) {
        self.read.add(other.read);
        self.write.add(other.write);
        self.passive.add(other.passive);
    }
}

/// Energy spent by one buffer during the period `log` covers
pub fn period_energy(
    log: &PeriodLog,
    profile: &ConsumptionProfile,
    bit_depth: usize,
    element_size: usize,
    buffer_size: u64,
    passive: bool,
) -> PeriodEnergy {
    let energy = |bytes: u64, category: ErrorCategory| {
        let index = log.rate_index[category.index()];
        let estimate = |kind| profile.estimate(bytes, bit_depth, element_size, kind, category, index);
        Energy {
            approximate: estimate(ConsumptionType::Approximate).unwrap_or(0.0),
            reference: estimate(ConsumptionType::Reference),
        }
    };

    PeriodEnergy {
        read: energy(log.accessed(AccessType::Read), ErrorCategory::Read),
        write: energy(log.accessed(AccessType::Write), ErrorCategory::Write),
        passive: if passive {
            energy(buffer_size, ErrorCategory::Passive)
        } else {
            Energy::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::{BitErrorConfig, ErrorRate};
    use approx::assert_relative_eq;

    fn profile() -> ConsumptionProfile {
        ConsumptionProfile {
            configuration_id: 0,
            reference: Some(CategoryValues {
                read: vec![2.0],
                write: vec![4.0],
                passive: vec![1.0],
            }),
            approximate: CategoryValues {
                read: vec![1.0, 0.5],
                write: vec![2.0],
                passive: vec![0.25],
            },
        }
    }

    #[test]
    fn test_estimate_scales_with_bit_depth() {
        let profile = profile();
        let full = profile
            .estimate(64, 32, 4, ConsumptionType::Approximate, ErrorCategory::Read, 0)
            .unwrap();
        assert_relative_eq!(full, 64.0);

        let narrow = profile
            .estimate(64, 16, 4, ConsumptionType::Approximate, ErrorCategory::Read, 1)
            .unwrap();
        assert_relative_eq!(narrow, 16.0);
    }

    #[test]
    fn test_missing_reference_is_none() {
        let mut profile = profile();
        profile.reference = None;
        assert!(profile
            .estimate(8, 8, 1, ConsumptionType::Reference, ErrorCategory::Write, 0)
            .is_none());
    }

    #[test]
    fn test_period_energy_uses_log_counters() {
        let ber = BitErrorConfig::constant(ErrorRate::ZERO, ErrorRate::ZERO, ErrorRate::ZERO).unwrap();
        let mut log = PeriodLog::new(0, &ber, 8, false);
        log.record_access(AccessType::Read, 10);
        log.record_access(AccessType::Write, 4);

        let energy = period_energy(&log, &profile(), 8, 1, 100, true);
        assert_relative_eq!(energy.read.approximate, 10.0);
        assert_relative_eq!(energy.write.approximate, 8.0);
        assert_relative_eq!(energy.passive.approximate, 25.0);
        assert_relative_eq!(energy.total().reference.unwrap(), 20.0 + 16.0 + 100.0);

        let idle = period_energy(&log, &profile(), 8, 1, 100, false);
        assert_eq!(idle.passive, Energy::default());
    }

    #[test]
    fn test_rejects_negative_values() {
        let mut profile = profile();
        profile.approximate.write = vec![-1.0];
        assert!(profile.validate().is_err());
    }
}
