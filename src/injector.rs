//! Fault injection strategies
//!
//! A [`FaultInjector`] corrupts the implemented bits of one element in place.
//! Bit `i` of an element lives in byte `i / 8` under mask `1 << (i % 8)`, so
//! a bit depth below the element width leaves the upper bits untouched.
//!
//! - `Default`: one Bernoulli trial per bit.
//! - `Granular`: one trial per element, flipping at most one random bit.
//! - `DistanceBased`: a renewal process; each (category, rate index) keeps a
//!   [`DistanceRecord`] with the byte distance to the next fault.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

use crate::ber::{BitErrorConfig, ErrorCategory, ErrorRate};
use crate::config::InjectorKind;
use crate::ApproxError;

/// Receiver of pre-corruption copies of element bytes
pub trait BackupTarget {
    /// Save `original`, the leading bytes of the element at `offset`, before
    /// any of its bits is flipped
    fn backup_read_data(&mut self, offset: usize, original: &[u8]);
}

/// Renewal state for the distance-based model
#[derive(Debug, Clone)]
pub struct DistanceRecord {
    distribution: Option<Normal<f64>>,
    next_error_distance: i64,
    injection_bit: usize,
}

impl DistanceRecord {
    /// A record that never injects
    pub fn disabled() -> Self {
        Self {
            distribution: None,
            next_error_distance: i64::MAX,
            injection_bit: 0,
        }
    }

    pub fn new(
        rate: &ErrorRate,
        element_size: usize,
        bit_depth: usize,
        rng: &mut StdRng,
    ) -> Result<Self, ApproxError> {
        let (mean, std_dev) = match rate {
            ErrorRate::Distance { mean, std_dev } => (*mean, *std_dev),
            other if other.is_disabled() => return Ok(Self::disabled()),
            other => {
                return Err(ApproxError::InvalidConfig(format!(
                    "distance based injector needs distance rates, got {other:?}"
                )))
            }
        };

        if rate.is_disabled() {
            return Ok(Self::disabled());
        }

        let normal = Normal::new(mean, std_dev)
            .map_err(|e| ApproxError::InvalidConfig(format!("distance distribution: {e}")))?;
        let mut record = Self {
            distribution: Some(normal),
            next_error_distance: 0,
            injection_bit: 0,
        };
        record.redraw(element_size as i64, bit_depth as i64, rng);
        Ok(record)
    }

    pub fn is_enabled(&self) -> bool {
        self.next_error_distance != i64::MAX
    }

    /// Bytes left before the next fault
    pub fn next_error_distance(&self) -> i64 {
        self.next_error_distance
    }

    /// Bit that the next fault flips
    pub fn injection_bit(&self) -> usize {
        self.injection_bit
    }

    fn redraw(&mut self, element_size: i64, bit_depth: i64, rng: &mut StdRng) {
        let Some(distribution) = self.distribution.as_ref() else {
            self.next_error_distance = i64::MAX;
            return;
        };

        // A zero draw would leave the fault in place forever.
        let step = (distribution.sample(rng).abs() as i64).max(1);
        let bits = (self.next_error_distance / element_size)
            .saturating_mul(bit_depth)
            .saturating_add(step);

        self.next_error_distance = (bits / bit_depth).saturating_mul(element_size);
        self.injection_bit = (bits % bit_depth).unsigned_abs() as usize;
    }
}

/// Bit-flipping engine of one buffer
#[derive(Debug, Clone)]
pub struct FaultInjector {
    kind: InjectorKind,
    bit_depth: usize,
    element_size: usize,
    backup_bytes: usize,
    rng: StdRng,
    bit_position: Uniform<usize>,
    records: [Vec<DistanceRecord>; ErrorCategory::COUNT],
    calls: u64,
}

impl FaultInjector {
    pub fn new(
        kind: InjectorKind,
        bit_depth: usize,
        element_size: usize,
        ber: &BitErrorConfig,
        seed: u64,
    ) -> Result<Self, ApproxError> {
        if bit_depth == 0 || bit_depth > element_size * 8 {
            return Err(ApproxError::InvalidConfig(format!(
                "bit depth {bit_depth} does not fit a {element_size} byte element"
            )));
        }

        let mut injector = Self {
            kind,
            bit_depth,
            element_size,
            backup_bytes: bit_depth.div_ceil(8),
            rng: StdRng::seed_from_u64(seed),
            bit_position: Uniform::new_inclusive(0, bit_depth - 1),
            records: Default::default(),
            calls: 0,
        };
        injector.rebuild_records(ber)?;
        Ok(injector)
    }

    pub fn kind(&self) -> InjectorKind {
        self.kind
    }

    pub fn bit_depth(&self) -> usize {
        self.bit_depth
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Bytes needed to cover `bit_depth` bits
    pub fn backup_bytes(&self) -> usize {
        self.backup_bytes
    }

    /// Number of injection calls so far
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn record(&self, category: ErrorCategory, index: u64) -> Option<&DistanceRecord> {
        let records = &self.records[category.index()];
        if records.is_empty() {
            return None;
        }
        records.get((index % records.len() as u64) as usize)
    }

    /// Recreate the distance records of every category
    pub fn rebuild_records(&mut self, ber: &BitErrorConfig) -> Result<(), ApproxError> {
        for category in ErrorCategory::ALL {
            self.rebuild_category(ber, category)?;
        }
        Ok(())
    }

    /// Recreate the records of `category` only and hand back the old ones
    ///
    /// The other categories keep their renewal state. On error nothing changes.
    pub fn rebuild_category(
        &mut self,
        ber: &BitErrorConfig,
        category: ErrorCategory,
    ) -> Result<Vec<DistanceRecord>, ApproxError> {
        let count = ber.rate_count(category) as u64;
        let mut records = Vec::new();

        for index in 0..count {
            let rate = ber.rate_at(category, index);
            match self.kind {
                InjectorKind::DistanceBased => records.push(DistanceRecord::new(
                    rate,
                    self.element_size,
                    self.bit_depth,
                    &mut self.rng,
                )?),
                _ if rate.is_distance() => {
                    return Err(ApproxError::InvalidConfig(format!(
                        "{category} distance rate needs the distance based injector"
                    )))
                }
                _ => {}
            }
        }
        Ok(std::mem::replace(&mut self.records[category.index()], records))
    }

    /// Inject into the element at `offset` with the configured strategy
    pub fn inject(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        rate: &ErrorRate,
        backup: Option<&mut dyn BackupTarget>,
        log: Option<&mut [u64]>,
    ) {
        self.calls += 1;
        match self.kind {
            InjectorKind::Granular => self.inject_granular(mem, offset, rate, backup, log),
            InjectorKind::Default | InjectorKind::DistanceBased => {
                self.inject_independent(mem, offset, rate, backup, log)
            }
        }
    }

    /// Inject an accumulated rate that may exceed one
    pub fn inject_overcharged(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        rate: &ErrorRate,
        log: Option<&mut [u64]>,
    ) {
        self.calls += 1;
        match self.kind {
            InjectorKind::Granular => self.overcharged_granular(mem, offset, rate, log),
            InjectorKind::Default | InjectorKind::DistanceBased => {
                self.overcharged_independent(mem, offset, rate, log)
            }
        }
    }

    /// Advance the renewal process over `access_len` bytes starting at `offset`
    #[allow(clippy::too_many_arguments)]
    pub fn inject_distance(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        access_len: usize,
        category: ErrorCategory,
        record_index: u64,
        backup: Option<&mut dyn BackupTarget>,
        log: Option<&mut [u64]>,
    ) {
        self.calls += 1;
        let records = &mut self.records[category.index()];
        if records.is_empty() {
            return;
        }
        let index = (record_index % records.len() as u64) as usize;

        let mut renewal = Renewal {
            rng: &mut self.rng,
            element_size: self.element_size,
            bit_depth: self.bit_depth,
            backup_bytes: self.backup_bytes,
        };
        renewal.run(&mut records[index], mem, offset, access_len, backup, log);
    }

    /// Same as [`Self::inject_distance`], driving a record the injector no
    /// longer owns
    pub fn inject_distance_with(
        &mut self,
        record: &mut DistanceRecord,
        mem: &mut [u8],
        offset: usize,
        access_len: usize,
        log: Option<&mut [u64]>,
    ) {
        self.calls += 1;
        let mut renewal = Renewal {
            rng: &mut self.rng,
            element_size: self.element_size,
            bit_depth: self.bit_depth,
            backup_bytes: self.backup_bytes,
        };
        renewal.run(record, mem, offset, access_len, None, log);
    }

    fn inject_independent(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        rate: &ErrorRate,
        mut backup: Option<&mut dyn BackupTarget>,
        mut log: Option<&mut [u64]>,
    ) {
        if rate.is_disabled() {
            return;
        }

        let mut backed_up = false;
        for bit in 0..self.bit_depth {
            if self.rng.gen::<f64>() >= rate.bit_probability(bit) {
                continue;
            }

            if !backed_up {
                if let Some(target) = backup.as_mut() {
                    target.backup_read_data(offset, backup_view(mem, offset, self.backup_bytes));
                }
                backed_up = true;
            }

            flip_bit(mem, offset, bit);
            count_flip(&mut log, bit, 1);
        }
    }

    fn inject_granular(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        rate: &ErrorRate,
        mut backup: Option<&mut dyn BackupTarget>,
        mut log: Option<&mut [u64]>,
    ) {
        let threshold = rate.mean_probability() * self.bit_depth as f64;
        if self.rng.gen::<f64>() >= threshold {
            return;
        }

        let bit = self.bit_position.sample(&mut self.rng);
        if let Some(target) = backup.as_mut() {
            target.backup_read_data(offset, backup_view(mem, offset, self.backup_bytes));
        }
        flip_bit(mem, offset, bit);
        count_flip(&mut log, bit, 1);
    }

    fn overcharged_independent(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        rate: &ErrorRate,
        mut log: Option<&mut [u64]>,
    ) {
        let remainder = match rate {
            ErrorRate::Probability(total) => {
                let whole = total.floor();
                for bit in 0..self.bit_depth {
                    count_flip(&mut log, bit, whole as u64);
                }

                let mut rest = total % 2.0;
                if rest >= 1.0 {
                    for bit in 0..self.bit_depth {
                        flip_bit(mem, offset, bit);
                    }
                    rest -= 1.0;
                    if rest == 0.0 {
                        return;
                    }
                }
                ErrorRate::Probability(rest)
            }
            ErrorRate::PerBit(totals) => {
                let mut rest = Vec::with_capacity(totals.len());
                for (bit, total) in totals.iter().enumerate().take(self.bit_depth) {
                    let whole = total.floor();
                    count_flip(&mut log, bit, whole as u64);
                    if whole as u64 % 2 == 1 {
                        flip_bit(mem, offset, bit);
                    }
                    rest.push(total - whole);
                }
                ErrorRate::PerBit(rest)
            }
            ErrorRate::Distance { .. } => return,
        };

        self.inject_independent(mem, offset, &remainder, None, log);
    }

    fn overcharged_granular(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        rate: &ErrorRate,
        mut log: Option<&mut [u64]>,
    ) {
        let depth = self.bit_depth as f64;
        let mut rest = rate.mean_probability();

        while rest * depth > 1.0 {
            let bit = self.bit_position.sample(&mut self.rng);
            flip_bit(mem, offset, bit);
            count_flip(&mut log, bit, 1);
            rest -= 1.0;
        }

        self.inject_independent(mem, offset, &ErrorRate::Probability(rest.max(0.0)), None, log);
    }
}

/// Element shape and generator borrowed for one distance walk
struct Renewal<'a> {
    rng: &'a mut StdRng,
    element_size: usize,
    bit_depth: usize,
    backup_bytes: usize,
}

impl Renewal<'_> {
    fn run(
        &mut self,
        record: &mut DistanceRecord,
        mem: &mut [u8],
        offset: usize,
        access_len: usize,
        mut backup: Option<&mut dyn BackupTarget>,
        mut log: Option<&mut [u64]>,
    ) {
        let mut remaining = access_len as i64;
        let mut cursor = offset as i64;
        let mut last_backup = None;

        record.next_error_distance = record.next_error_distance.saturating_sub(remaining);

        while record.next_error_distance < 0 {
            cursor += remaining + record.next_error_distance;
            let position = cursor as usize;

            if let Some(target) = backup.as_mut() {
                if last_backup != Some(position) {
                    target.backup_read_data(position, backup_view(mem, position, self.backup_bytes));
                    last_backup = Some(position);
                }
            }

            let bit = record.injection_bit;
            flip_bit(mem, position, bit);
            count_flip(&mut log, bit, 1);

            remaining = -record.next_error_distance;
            record.redraw(self.element_size as i64, self.bit_depth as i64, self.rng);
        }
    }
}

fn backup_view(mem: &[u8], offset: usize, len: usize) -> &[u8] {
    let end = (offset + len).min(mem.len());
    &mem[offset.min(end)..end]
}

fn flip_bit(mem: &mut [u8], offset: usize, bit: usize) {
    if let Some(byte) = mem.get_mut(offset + bit / 8) {
        *byte ^= 1 << (bit % 8);
    }
}

fn count_flip(log: &mut Option<&mut [u64]>, bit: usize, amount: u64) {
    if let Some(counts) = log.as_deref_mut() {
        if let Some(count) = counts.get_mut(bit) {
            *count += amount;
        }
    }
}
