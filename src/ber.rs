//! Bit error rate configuration
//!
//! Every buffer carries a [`BitErrorConfig`]: for each [`ErrorCategory`] an
//! ordered, non-empty sequence of [`ErrorRate`]s. A single-entry sequence is a
//! constant rate; longer sequences rotate once per period, indexed by
//! `period - creation_period` modulo the sequence length.

use serde::{Deserialize, Serialize};

use crate::ApproxError;

/// Kind of fault a rate applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Read,
    Write,
    Passive,
}

impl ErrorCategory {
    pub const COUNT: usize = 3;
    pub const ALL: [ErrorCategory; Self::COUNT] =
        [ErrorCategory::Read, ErrorCategory::Write, ErrorCategory::Passive];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCategory::Read => "read",
            ErrorCategory::Write => "write",
            ErrorCategory::Passive => "passive",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single error model value
///
/// In configuration files a bare number is a [`ErrorRate::Probability`], an
/// array of numbers is a [`ErrorRate::PerBit`] profile and a table with
/// `mean`/`std_dev` keys is a [`ErrorRate::Distance`] model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorRate {
    /// Flip probability applied to every implemented bit
    Probability(f64),
    /// One flip probability per bit position, least significant first
    PerBit(Vec<f64>),
    /// Normal distribution of the distance, in bits, between two faults
    Distance { mean: f64, std_dev: f64 },
}

impl ErrorRate {
    pub const ZERO: ErrorRate = ErrorRate::Probability(0.0);

    /// True when this rate can never produce a fault
    pub fn is_disabled(&self) -> bool {
        match self {
            ErrorRate::Probability(p) => *p == 0.0,
            ErrorRate::PerBit(bits) => bits.iter().all(|p| *p == 0.0),
            ErrorRate::Distance { mean, std_dev } => *mean == 0.0 && *std_dev == 0.0,
        }
    }

    pub fn is_distance(&self) -> bool {
        matches!(self, ErrorRate::Distance { .. })
    }

    /// Flip probability for one bit position
    pub fn bit_probability(&self, bit: usize) -> f64 {
        match self {
            ErrorRate::Probability(p) => *p,
            ErrorRate::PerBit(bits) => bits.get(bit).copied().unwrap_or(0.0),
            ErrorRate::Distance { .. } => 0.0,
        }
    }

    /// Average flip probability over all bit positions
    pub fn mean_probability(&self) -> f64 {
        match self {
            ErrorRate::Probability(p) => *p,
            ErrorRate::PerBit(bits) if bits.is_empty() => 0.0,
            ErrorRate::PerBit(bits) => bits.iter().sum::<f64>() / bits.len() as f64,
            ErrorRate::Distance { .. } => 0.0,
        }
    }

    fn check(&self, category: ErrorCategory) -> Result<(), ApproxError> {
        let out_of_range = |value: f64| ApproxError::RateOutOfRange { category, value };
        match self {
            ErrorRate::Probability(p) => {
                if !(0.0..1.0).contains(p) {
                    return Err(out_of_range(*p));
                }
            }
            ErrorRate::PerBit(bits) => {
                if let Some(p) = bits.iter().find(|p| !(0.0..1.0).contains(*p)) {
                    return Err(out_of_range(*p));
                }
            }
            ErrorRate::Distance { mean, std_dev } => {
                if !mean.is_finite() || !std_dev.is_finite() || *mean < 0.0 || *std_dev < 0.0 {
                    return Err(ApproxError::InvalidConfig(format!(
                        "{category} distance model needs finite non-negative parameters, got mean {mean} std_dev {std_dev}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Add `rate * times` to an accumulated passive rate
fn accumulate(acc: ErrorRate, rate: &ErrorRate, times: f64) -> ErrorRate {
    match (acc, rate) {
        (ErrorRate::Probability(a), ErrorRate::Probability(b)) => {
            ErrorRate::Probability(a + b * times)
        }
        (ErrorRate::Probability(a), ErrorRate::PerBit(bits)) => {
            ErrorRate::PerBit(bits.iter().map(|b| a + b * times).collect())
        }
        (ErrorRate::PerBit(mut acc), ErrorRate::Probability(b)) => {
            acc.iter_mut().for_each(|v| *v += b * times);
            ErrorRate::PerBit(acc)
        }
        (ErrorRate::PerBit(mut acc), ErrorRate::PerBit(bits)) => {
            if acc.len() < bits.len() {
                acc.resize(bits.len(), 0.0);
            }
            for (v, b) in acc.iter_mut().zip(bits) {
                *v += b * times;
            }
            ErrorRate::PerBit(acc)
        }
        (acc, ErrorRate::Distance { .. }) => acc,
        (ErrorRate::Distance { .. }, rate) => accumulate(ErrorRate::ZERO, rate, times),
    }
}

/// Per-buffer view of the configured rates, anchored at a creation period
#[derive(Debug, Clone)]
pub struct BitErrorConfig {
    sequences: [Vec<ErrorRate>; ErrorCategory::COUNT],
    creation_period: u64,
    period_index: u64,
    should_go_on: [bool; ErrorCategory::COUNT],
}

impl BitErrorConfig {
    /// Create a configuration whose rotation starts at `creation_period`
    pub fn new(
        sequences: [Vec<ErrorRate>; ErrorCategory::COUNT],
        creation_period: u64,
    ) -> Result<Self, ApproxError> {
        for category in ErrorCategory::ALL {
            check_sequence(category, &sequences[category.index()])?;
        }

        let mut config = Self {
            sequences,
            creation_period,
            period_index: 0,
            should_go_on: [false; ErrorCategory::COUNT],
        };
        config.revise_all();
        Ok(config)
    }

    /// Constant rates, one per category
    pub fn constant(read: ErrorRate, write: ErrorRate, passive: ErrorRate) -> Result<Self, ApproxError> {
        Self::new([vec![read], vec![write], vec![passive]], 0)
    }

    /// Rate active in the current period
    pub fn rate(&self, category: ErrorCategory) -> &ErrorRate {
        self.rate_at(category, self.period_index)
    }

    /// Rate at a rotation index, wrapped modulo the sequence length
    pub fn rate_at(&self, category: ErrorCategory, index: u64) -> &ErrorRate {
        let sequence = &self.sequences[category.index()];
        &sequence[(index % sequence.len() as u64) as usize]
    }

    pub fn sequence(&self, category: ErrorCategory) -> &[ErrorRate] {
        &self.sequences[category.index()]
    }

    pub fn rate_count(&self, category: ErrorCategory) -> usize {
        self.sequences[category.index()].len()
    }

    /// Position of the active rate inside its sequence
    pub fn current_index(&self, category: ErrorCategory) -> usize {
        (self.period_index % self.rate_count(category) as u64) as usize
    }

    pub fn creation_period(&self) -> u64 {
        self.creation_period
    }

    /// Periods elapsed since the creation period
    pub fn period_index(&self) -> u64 {
        self.period_index
    }

    pub fn index_for_period(&self, period: u64) -> u64 {
        period.saturating_sub(self.creation_period)
    }

    pub fn set_rate(&mut self, category: ErrorCategory, rate: ErrorRate) -> Result<(), ApproxError> {
        self.set_rate_sequence(category, vec![rate])
    }

    pub fn set_rate_sequence(
        &mut self,
        category: ErrorCategory,
        sequence: Vec<ErrorRate>,
    ) -> Result<(), ApproxError> {
        check_sequence(category, &sequence)?;
        self.sequences[category.index()] = sequence;
        self.revise(category);
        Ok(())
    }

    /// Re-derive the active rates for `period`
    pub fn advance_period_index(&mut self, period: u64) {
        self.period_index = self.index_for_period(period);
        self.revise_all();
    }

    /// Re-anchor the rotation so that `period` selects the first rate
    pub fn reset_creation_period(&mut self, period: u64) {
        self.creation_period = period;
        self.period_index = 0;
        self.revise_all();
    }

    /// Whether the active rate can inject at all
    pub fn should_inject(&self, category: ErrorCategory) -> bool {
        self.should_go_on[category.index()]
    }

    /// Sum of the per-period rates over the periods `[past, current)`
    ///
    /// Full rotations of the sequence are charged in one multiplication, so the
    /// cost does not depend on how long the interval is.
    pub fn accumulated_rate(&self, category: ErrorCategory, past: u64, current: u64) -> ErrorRate {
        if current <= past {
            return ErrorRate::ZERO;
        }

        let delta = current - past;
        let sequence = &self.sequences[category.index()];
        let count = sequence.len() as u64;

        if count == 1 {
            return accumulate(ErrorRate::ZERO, &sequence[0], delta as f64);
        }

        let mut total = ErrorRate::ZERO;
        let full_rotations = delta / count;
        if full_rotations > 0 {
            for rate in sequence {
                total = accumulate(total, rate, full_rotations as f64);
            }
        }

        let start = self.index_for_period(past);
        for step in 0..(delta % count) {
            total = accumulate(total, self.rate_at(category, start + step), 1.0);
        }
        total
    }

    fn revise_all(&mut self) {
        for category in ErrorCategory::ALL {
            self.revise(category);
        }
    }

    fn revise(&mut self, category: ErrorCategory) {
        let rotating_passive =
            category == ErrorCategory::Passive && self.rate_count(category) > 1;
        self.should_go_on[category.index()] =
            !self.rate(category).is_disabled() || rotating_passive;
    }
}

fn check_sequence(category: ErrorCategory, sequence: &[ErrorRate]) -> Result<(), ApproxError> {
    if sequence.is_empty() {
        return Err(ApproxError::InvalidConfig(format!(
            "{category} rate sequence must not be empty"
        )));
    }
    sequence.iter().try_for_each(|rate| rate.check(category))
}
