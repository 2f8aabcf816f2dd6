//! Approximate buffers
//!
//! An [`ApproximateBuffer`] owns one registered range, its [`FaultInjector`],
//! its rate view and its period logs. *When* a decided fault reaches memory
//! is delegated to a [`Materialization`]:
//!
//! - [`ShortTermState`]: pending faults live in address-ordered maps and are
//!   applied by the next access that touches them.
//! - [`LongTermState`]: a status byte per element, with backup and snapshot
//!   slots in flat pooled arrays.
//!
//! Retiring a buffer flushes every pending fault and archives its log, but the
//! buffer itself stays around for reactivation and reporting.

mod long_term;
mod passive;
mod short_term;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::ber::{BitErrorConfig, ErrorCategory, ErrorRate};
use crate::config::{BufferKind, EngineConfig, InjectorConfiguration, InjectorKind};
use crate::injector::{BackupTarget, DistanceRecord, FaultInjector};
use crate::period_log::{AccessType, PeriodLog};
use crate::pool::BufferPool;
use crate::range::Range;
use crate::ApproxError;

pub use long_term::LongTermState;
pub use short_term::ShortTermState;

/// Per-element fault state of a long-term buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorStatus {
    #[default]
    None,
    /// The element was corrupted by a read and its backup awaits restoration
    PendingRead,
    /// A write fault was decided and awaits the next read
    PendingWrite,
}

/// Write-time rate selection, replayed when the fault is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSnapshot {
    /// Rotation index of the write rate when the write happened
    pub rate_index: u64,
    /// Write sequence the index refers to; bumped on every rate change
    pub generation: u32,
}

/// Write rates replaced while faults decided under them were still pending
#[derive(Debug, Clone)]
pub(crate) struct SupersededWrites {
    rates: Vec<ErrorRate>,
    records: Vec<DistanceRecord>,
}

/// Identity of a registered buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BufferKey {
    pub range: Range,
    pub buffer_id: i64,
    pub config_id: i64,
    pub element_size: usize,
}

/// Outstanding fault state, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub pending_reads: usize,
    pub pending_writes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferDiagnostics {
    pub key: BufferKey,
    pub element_count: usize,
    pub bit_depth: usize,
    pub active: bool,
    pub refcount: u32,
    pub activations: u32,
    pub current_period: u64,
    pub pending: PendingCounts,
    pub archived_periods: usize,
}

/// State shared by both materialization strategies
#[derive(Debug, Clone)]
pub(crate) struct BufferCore {
    pub(crate) injector: FaultInjector,
    pub(crate) ber: BitErrorConfig,
    pub(crate) log: PeriodLog,
    pub(crate) element_size: usize,
    pub(crate) element_count: usize,
    pub(crate) log_faults: bool,
    pub(crate) passive: bool,
    pub(crate) overcharge: bool,
    pub(crate) current_period: u64,
    /// Period up to which each element has been charged passive decay
    pub(crate) last_access: Vec<u64>,
    pub(crate) write_generation: u32,
    /// Older write sequences, by generation, kept until their faults land
    pub(crate) superseded: BTreeMap<u32, SupersededWrites>,
}

impl BufferCore {
    pub(crate) fn is_distance(&self) -> bool {
        self.injector.kind() == InjectorKind::DistanceBased
    }

    pub(crate) fn write_due(&self, inject: bool) -> bool {
        inject && self.ber.should_inject(ErrorCategory::Write)
    }

    pub(crate) fn read_due(&self, inject: bool) -> bool {
        inject && self.ber.should_inject(ErrorCategory::Read)
    }

    pub(crate) fn snapshot(&self) -> WriteSnapshot {
        WriteSnapshot {
            rate_index: self.ber.period_index(),
            generation: self.write_generation,
        }
    }

    /// Materialize a write fault with the rate selected when it was decided
    pub(crate) fn apply_write_fault(&mut self, mem: &mut [u8], offset: usize, snapshot: WriteSnapshot) {
        let log = self.log.fault_counts_mut(ErrorCategory::Write);
        if snapshot.generation != self.write_generation {
            let Some(old) = self.superseded.get_mut(&snapshot.generation) else {
                return;
            };
            if self.injector.kind() == InjectorKind::DistanceBased {
                let count = old.records.len() as u64;
                if count == 0 {
                    return;
                }
                let record = &mut old.records[(snapshot.rate_index % count) as usize];
                let len = self.element_size;
                self.injector.inject_distance_with(record, mem, offset, len, log);
            } else {
                let rate = &old.rates[(snapshot.rate_index % old.rates.len() as u64) as usize];
                self.injector.inject(mem, offset, rate, None, log);
            }
            return;
        }

        if self.injector.kind() == InjectorKind::DistanceBased {
            let len = self.element_size;
            self.injector.inject_distance(
                mem,
                offset,
                len,
                ErrorCategory::Write,
                snapshot.rate_index,
                None,
                log,
            );
        } else {
            let rate = self.ber.rate_at(ErrorCategory::Write, snapshot.rate_index);
            self.injector.inject(mem, offset, rate, None, log);
        }
    }

    /// Read fault for one element; the distance model uses [`Self::inject_read_span`]
    pub(crate) fn inject_read_element(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        backup: &mut dyn BackupTarget,
    ) {
        if self.is_distance() {
            return;
        }
        let rate = self.ber.rate(ErrorCategory::Read);
        let log = self.log.fault_counts_mut(ErrorCategory::Read);
        self.injector.inject(mem, offset, rate, Some(backup), log);
    }

    /// Read faults of the distance model over a whole access
    pub(crate) fn inject_read_span(
        &mut self,
        mem: &mut [u8],
        offset: usize,
        len: usize,
        backup: &mut dyn BackupTarget,
    ) {
        if !self.is_distance() {
            return;
        }
        let index = self.ber.period_index();
        let log = self.log.fault_counts_mut(ErrorCategory::Read);
        self.injector.inject_distance(
            mem,
            offset,
            len,
            ErrorCategory::Read,
            index,
            Some(backup),
            log,
        );
    }

    fn fresh_log(&self, period: u64) -> PeriodLog {
        PeriodLog::new(period, &self.ber, self.injector.bit_depth(), self.log_faults)
    }
}

/// How a buffer turns decided faults into flipped bits
///
/// Offsets are relative to the start of the buffer's range and always point
/// at the first byte of an element; `mem` covers the whole range.
pub(crate) trait Materializer {
    fn write_element(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, inject: bool);

    fn read_element(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, inject: bool);

    /// Write covering the elements in `[offset, offset + len)`
    fn write_run(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, len: usize, inject: bool) {
        for element in (offset..offset + len).step_by(core.element_size) {
            self.write_element(core, mem, element, inject);
        }
    }

    /// Read covering the elements in `[offset, offset + len)`
    fn read_run(&mut self, core: &mut BufferCore, mem: &mut [u8], offset: usize, len: usize, inject: bool);

    /// Restore every pending read and materialize every pending write
    fn flush(&mut self, core: &mut BufferCore, mem: &mut [u8]);

    /// Take backing storage for a fresh active interval
    fn acquire(&mut self, core: &BufferCore, pool: &mut BufferPool);

    /// Drop backing storage, handing it to `pool` when `give_away` is set
    fn release(&mut self, pool: &mut BufferPool, give_away: bool);

    fn pending(&self) -> PendingCounts;
}

/// Materialization strategy chosen at construction
#[derive(Debug, Clone)]
pub enum Materialization {
    ShortTerm(ShortTermState),
    LongTerm(LongTermState),
}

impl Materialization {
    fn new(kind: BufferKind, element_size: usize, backup_bytes: usize) -> Self {
        match kind {
            BufferKind::ShortTerm => Materialization::ShortTerm(ShortTermState::new()),
            BufferKind::LongTerm => {
                Materialization::LongTerm(LongTermState::new(element_size, backup_bytes))
            }
        }
    }

    fn materializer(&mut self) -> &mut dyn Materializer {
        match self {
            Materialization::ShortTerm(state) => state,
            Materialization::LongTerm(state) => state,
        }
    }

    pub fn pending(&self) -> PendingCounts {
        match self {
            Materialization::ShortTerm(state) => state.pending(),
            Materialization::LongTerm(state) => state.pending(),
        }
    }
}

/// One registered approximate range and its history
#[derive(Debug, Clone)]
pub struct ApproximateBuffer {
    key: BufferKey,
    creation_period: u64,
    refcount: u32,
    activations: u32,
    core: BufferCore,
    strategy: Materialization,
    archived: BTreeMap<u64, PeriodLog>,
}

impl ApproximateBuffer {
    /// Build an inactive buffer; [`Self::activate`] starts its first interval
    pub fn new(
        key: BufferKey,
        config: &InjectorConfiguration,
        engine: &EngineConfig,
        period: u64,
        seed: u64,
    ) -> Result<Self, ApproxError> {
        let invalid = |reason: String| ApproxError::InvalidBuffer {
            buffer_id: key.buffer_id,
            reason,
        };

        if key.element_size == 0 {
            return Err(invalid("element size must be greater than zero".to_string()));
        }
        let size = key.range.size() as usize;
        if size < key.element_size {
            return Err(invalid(format!(
                "range {} is smaller than one {} byte element",
                key.range, key.element_size
            )));
        }

        let ber = config
            .bit_error_config(period)
            .map_err(|e| invalid(e.to_string()))?;
        let injector = FaultInjector::new(engine.injector, config.bit_depth, key.element_size, &ber, seed)
            .map_err(|e| invalid(e.to_string()))?;
        let log = PeriodLog::new(period, &ber, config.bit_depth, engine.log_faults);
        let strategy = Materialization::new(engine.buffer, key.element_size, injector.backup_bytes());

        Ok(Self {
            key,
            creation_period: period,
            refcount: 0,
            activations: 0,
            core: BufferCore {
                injector,
                ber,
                log,
                element_size: key.element_size,
                element_count: size / key.element_size,
                log_faults: engine.log_faults,
                passive: engine.passive_injection,
                overcharge: engine.overcharge_flip_back,
                current_period: period,
                last_access: Vec::new(),
                write_generation: 0,
                superseded: BTreeMap::new(),
            },
            strategy,
            archived: BTreeMap::new(),
        })
    }

    pub fn key(&self) -> &BufferKey {
        &self.key
    }

    pub fn range(&self) -> Range {
        self.key.range
    }

    pub fn element_count(&self) -> usize {
        self.core.element_count
    }

    pub fn bit_depth(&self) -> usize {
        self.core.injector.bit_depth()
    }

    pub fn creation_period(&self) -> u64 {
        self.creation_period
    }

    pub fn is_active(&self) -> bool {
        self.refcount > 0
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn activations(&self) -> u32 {
        self.activations
    }

    pub fn ber(&self) -> &BitErrorConfig {
        &self.core.ber
    }

    /// Log of the running period while the buffer is active
    pub fn current_log(&self) -> Option<&PeriodLog> {
        self.is_active().then_some(&self.core.log)
    }

    pub fn archived_logs(&self) -> &BTreeMap<u64, PeriodLog> {
        &self.archived
    }

    pub fn pending(&self) -> PendingCounts {
        self.strategy.pending()
    }

    pub fn diagnostics(&self) -> BufferDiagnostics {
        BufferDiagnostics {
            key: self.key,
            element_count: self.core.element_count,
            bit_depth: self.bit_depth(),
            active: self.is_active(),
            refcount: self.refcount,
            activations: self.activations,
            current_period: self.core.current_period,
            pending: self.pending(),
            archived_periods: self.archived.len(),
        }
    }

    /// Replace the rates of `category`, keeping the rotation anchor
    ///
    /// Write faults that are still pending land with the rate they were
    /// decided under.
    pub fn set_rate_sequence(
        &mut self,
        category: ErrorCategory,
        sequence: Vec<ErrorRate>,
    ) -> Result<(), ApproxError> {
        let invalid = |e: ApproxError| ApproxError::InvalidBuffer {
            buffer_id: self.key.buffer_id,
            reason: e.to_string(),
        };
        let mut ber = self.core.ber.clone();
        ber.set_rate_sequence(category, sequence).map_err(invalid)?;
        let records = self
            .core
            .injector
            .rebuild_category(&ber, category)
            .map_err(invalid)?;

        if category == ErrorCategory::Write {
            if self.pending().pending_writes > 0 {
                let rates = self.core.ber.sequence(ErrorCategory::Write).to_vec();
                self.core
                    .superseded
                    .insert(self.core.write_generation, SupersededWrites { rates, records });
            }
            self.core.write_generation = self.core.write_generation.wrapping_add(1);
        }
        self.core.ber = ber;
        Ok(())
    }

    /// Start an active interval at `period`, or join the running one
    pub fn activate(&mut self, pool: &mut BufferPool, period: u64) {
        if self.refcount > 0 {
            self.refcount += 1;
            return;
        }

        if self.activations > 0 {
            self.core.ber.reset_creation_period(period);
        }
        self.core.current_period = period;
        self.core.log = match self.archived.remove(&period) {
            Some(log) => log,
            None => self.core.fresh_log(period),
        };

        self.core.acquire_marks(pool);
        self.strategy.materializer().acquire(&self.core, pool);

        self.refcount = 1;
        self.activations += 1;
    }

    /// Drop one reference; the last one flushes, releases and archives
    ///
    /// Returns true when the buffer became inactive.
    pub fn retire(&mut self, mem: Option<&mut [u8]>, pool: &mut BufferPool, give_away: bool) -> bool {
        match self.refcount {
            0 => return false,
            1 => {}
            _ => {
                self.refcount -= 1;
                return false;
            }
        }

        if let Some(mem) = mem {
            self.strategy.materializer().flush(&mut self.core, mem);
            self.core.flush_passive(mem);
        }
        self.strategy.materializer().release(pool, give_away);
        self.core.release_marks(pool, give_away);
        self.core.superseded.clear();

        let period = self.core.current_period;
        let placeholder = self.core.fresh_log(period);
        let log = std::mem::replace(&mut self.core.log, placeholder);
        self.archived.insert(period, log);

        self.refcount = 0;
        true
    }

    /// Close the running period and open `period`
    pub fn next_period(&mut self, mem: Option<&mut [u8]>, period: u64) {
        if !self.is_active() || period == self.core.current_period {
            return;
        }

        if let Some(mem) = mem {
            self.core.walk_passive(mem);
        }

        self.core.ber.advance_period_index(period);
        self.core.current_period = period;
        let fresh = self.core.fresh_log(period);
        let closed = std::mem::replace(&mut self.core.log, fresh);
        self.archived.insert(closed.period, closed);
    }

    /// Route an access at `address` through the materialization strategy
    ///
    /// The access is clipped to the buffer's elements and widened to element
    /// boundaries; one element's worth goes through the single-element path.
    /// An access narrower than an element that starts off an element boundary
    /// is ignored entirely.
    pub fn access(
        &mut self,
        mem: &mut [u8],
        address: u64,
        size: usize,
        access: AccessType,
        inject: bool,
    ) {
        if !self.is_active() || size == 0 {
            return;
        }
        let Some(offset) = self.key.range.offset_of(address) else {
            return;
        };
        let element_size = self.core.element_size;
        let limit = self.core.element_count * element_size;
        if offset >= limit {
            return;
        }
        // A partial access into the middle of an element is not tracked.
        if offset % element_size != 0 && size < element_size {
            return;
        }

        let len = size.min(limit - offset);
        self.core.log.record_access(access, len);

        let first = offset / element_size * element_size;
        let last = (offset + len).div_ceil(element_size) * element_size;
        let span = last - first;

        let strategy = self.strategy.materializer();
        match (access, span == element_size) {
            (AccessType::Read, true) => strategy.read_element(&mut self.core, mem, first, inject),
            (AccessType::Read, false) => strategy.read_run(&mut self.core, mem, first, span, inject),
            (AccessType::Write, true) => strategy.write_element(&mut self.core, mem, first, inject),
            (AccessType::Write, false) => strategy.write_run(&mut self.core, mem, first, span, inject),
        }
    }
}
