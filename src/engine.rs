//! Engine context
//!
//! [`Engine`] bundles every piece of process-wide state: the injector
//! configurations, the registry of known buffers, the active-range index, the
//! shared [`BufferPool`], the simulated memory and the current period. All of
//! it sits behind one lock, so registration, period changes and buffer state
//! mutation observe a single total order.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::ber::{ErrorCategory, ErrorRate};
use crate::buffer::{ApproximateBuffer, BufferDiagnostics, BufferKey};
use crate::config::{EngineConfig, InjectorConfiguration};
use crate::energy::ConsumptionProfile;
use crate::memory::AddressSpace;
use crate::period_log::AccessType;
use crate::pool::BufferPool;
use crate::range::Range;
use crate::report::EngineReport;
use crate::ApproxError;

/// Outcome of [`Engine::register_buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First registration of this identity
    Created,
    /// A retired buffer with this identity became active again
    Reactivated,
    /// The identical active buffer gained another reference
    Shared,
    /// The range overlaps an active buffer; nothing changed
    Ignored,
}

/// Outcome of [`Engine::unregister_buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregistration {
    /// The last reference was dropped; pending state has been flushed
    Retired,
    /// Another reference keeps the buffer active
    Released,
    NotFound,
}

pub(crate) struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) injectors: BTreeMap<i64, InjectorConfiguration>,
    pub(crate) consumption: BTreeMap<i64, ConsumptionProfile>,
    pub(crate) buffers: BTreeMap<BufferKey, ApproximateBuffer>,
    /// Active buffers by range start; active ranges never overlap
    pub(crate) active: BTreeMap<u64, BufferKey>,
    pub(crate) pool: BufferPool,
    pub(crate) memory: Box<dyn AddressSpace>,
    pub(crate) current_period: u64,
    pub(crate) injection_enabled: bool,
    pub(crate) injection_level: i64,
    rng: StdRng,
}

impl EngineState {
    fn should_inject(&self) -> bool {
        self.injection_enabled && self.injection_level != 0
    }

    /// Active buffers intersecting `[start, end)`, in address order
    fn intersecting(&self, start: u64, end: u64) -> Vec<BufferKey> {
        let mut keys: Vec<BufferKey> = self
            .active
            .range(..end)
            .rev()
            .map(|(_, key)| *key)
            .take_while(|key| key.range.end() > start)
            .collect();
        keys.reverse();
        keys
    }

    fn access(&mut self, address: u64, size: usize, access: AccessType, inject: bool) {
        let Some(end) = address.checked_add(size as u64) else {
            warn!(address, size, "access wraps the address space");
            return;
        };

        for key in self.intersecting(address, end) {
            let range = key.range;
            let Some(buffer) = self.buffers.get_mut(&key) else {
                continue;
            };
            let Some(mem) = self.memory.bytes_mut(range.start(), range.size() as usize) else {
                warn!(%range, "buffer is not backed by mapped memory");
                continue;
            };

            let start = address.max(range.start());
            let len = (end.min(range.end()) - start) as usize;
            buffer.access(mem, start, len, access, inject);
        }
    }
}

/// Fault-injection engine shared by every instrumented thread
pub struct Engine {
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        injectors: Vec<InjectorConfiguration>,
        memory: Box<dyn AddressSpace>,
    ) -> Result<Self, ApproxError> {
        Self::with_consumption(config, injectors, Vec::new(), memory)
    }

    pub fn with_consumption(
        config: EngineConfig,
        injectors: Vec<InjectorConfiguration>,
        consumption: Vec<ConsumptionProfile>,
        memory: Box<dyn AddressSpace>,
    ) -> Result<Self, ApproxError> {
        config.validate()?;

        let mut by_id = BTreeMap::new();
        for injector in injectors {
            injector.validate(&config)?;
            let id = injector.id;
            if by_id.insert(id, injector).is_some() {
                return Err(ApproxError::InvalidConfig(format!(
                    "duplicate injector configuration id {id}"
                )));
            }
        }

        let mut profiles = BTreeMap::new();
        for profile in consumption {
            profile.validate()?;
            profiles.insert(profile.configuration_id, profile);
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            state: Mutex::new(EngineState {
                current_period: config.initial_period,
                injection_enabled: config.injection_enabled,
                injection_level: config.injection_level,
                config,
                injectors: by_id,
                consumption: profiles,
                buffers: BTreeMap::new(),
                active: BTreeMap::new(),
                pool: BufferPool::new(),
                memory,
                rng,
            }),
        })
    }

    /// Make `range` approximate under configuration `config_id`
    ///
    /// A never-seen identity creates a buffer, a retired one is reactivated.
    /// Overlapping an active buffer is a conflict: it is logged and ignored,
    /// unless shared registration is on and the identity matches exactly.
    pub fn register_buffer(
        &self,
        range: Range,
        buffer_id: i64,
        config_id: i64,
        element_size: usize,
    ) -> Result<Registration, ApproxError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let key = BufferKey {
            range,
            buffer_id,
            config_id,
            element_size,
        };

        let conflicts = state.intersecting(range.start(), range.end());
        if let Some(active) = conflicts.first() {
            if state.config.shared_registration && conflicts.len() == 1 && *active == key {
                if let Some(buffer) = state.buffers.get_mut(&key) {
                    buffer.activate(&mut state.pool, state.current_period);
                    debug!(buffer_id, %range, refcount = buffer.refcount(), "shared registration");
                    return Ok(Registration::Shared);
                }
            }
            warn!(
                buffer_id,
                %range,
                active = %active.range,
                "range overlaps an active buffer, registration ignored"
            );
            return Ok(Registration::Ignored);
        }

        let period = state.current_period;
        let outcome = match state.buffers.get_mut(&key) {
            Some(buffer) => {
                buffer.activate(&mut state.pool, period);
                info!(buffer_id, %range, period, activations = buffer.activations(), "buffer reactivated");
                Registration::Reactivated
            }
            None => {
                let config = state
                    .injectors
                    .get(&config_id)
                    .ok_or(ApproxError::UnknownConfiguration(config_id))?;
                let seed = state.rng.gen::<u64>();
                let mut buffer = ApproximateBuffer::new(key, config, &state.config, period, seed)?;
                buffer.activate(&mut state.pool, period);
                info!(
                    buffer_id,
                    config_id,
                    %range,
                    element_size,
                    elements = buffer.element_count(),
                    period,
                    "buffer created"
                );
                state.buffers.insert(key, buffer);
                Registration::Created
            }
        };

        state.active.insert(range.start(), key);
        Ok(outcome)
    }

    /// Drop one reference to the active buffer registered exactly at `range`
    ///
    /// With `give_away` the retired buffer's arrays go to the pool for reuse.
    pub fn unregister_buffer(&self, range: Range, give_away: bool) -> Unregistration {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let key = match state.active.get(&range.start()) {
            Some(key) if key.range == range => *key,
            _ => {
                warn!(%range, "no active buffer for range, removal ignored");
                return Unregistration::NotFound;
            }
        };
        let Some(buffer) = state.buffers.get_mut(&key) else {
            return Unregistration::NotFound;
        };

        let mem = state.memory.bytes_mut(range.start(), range.size() as usize);
        if mem.is_none() {
            warn!(%range, "buffer is not backed by mapped memory, pending faults dropped");
        }

        if buffer.retire(mem, &mut state.pool, give_away) {
            state.active.remove(&range.start());
            info!(buffer_id = key.buffer_id, %range, period = state.current_period, "buffer retired");
            Unregistration::Retired
        } else {
            debug!(buffer_id = key.buffer_id, %range, refcount = buffer.refcount(), "buffer released");
            Unregistration::Released
        }
    }

    /// Retire every active buffer, regardless of its reference count
    pub fn retire_all(&self, give_away: bool) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let active = std::mem::take(&mut state.active);

        for key in active.values() {
            let Some(buffer) = state.buffers.get_mut(key) else {
                continue;
            };
            let range = key.range;
            while buffer.is_active() {
                let mem = state.memory.bytes_mut(range.start(), range.size() as usize);
                buffer.retire(mem, &mut state.pool, give_away);
            }
            info!(buffer_id = key.buffer_id, %range, "buffer retired");
        }
        active.len()
    }

    /// Move to `period`, archiving every active buffer's log
    pub fn advance_period(&self, period: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if period <= state.current_period {
            warn!(
                current = state.current_period,
                requested = period,
                "period did not advance, ignored"
            );
            return;
        }

        debug!(from = state.current_period, to = period, "next period");
        for key in state.active.values() {
            if let Some(buffer) = state.buffers.get_mut(key) {
                let range = key.range;
                let mem = state.memory.bytes_mut(range.start(), range.size() as usize);
                buffer.next_period(mem, period);
            }
        }
        state.current_period = period;
    }

    /// Replace the `category` rates of configuration `config_id`
    ///
    /// Every buffer built from that configuration, active or retired, picks
    /// up the new rates. Returns the number of buffers updated.
    pub fn set_rates(
        &self,
        config_id: i64,
        category: ErrorCategory,
        rates: Vec<ErrorRate>,
    ) -> Result<usize, ApproxError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut updated = state
            .injectors
            .get(&config_id)
            .cloned()
            .ok_or(ApproxError::UnknownConfiguration(config_id))?;
        match category {
            ErrorCategory::Read => updated.read = rates.clone(),
            ErrorCategory::Write => updated.write = rates.clone(),
            ErrorCategory::Passive => updated.passive = rates.clone(),
        }
        updated.validate(&state.config)?;

        let mut changed = 0;
        for buffer in state.buffers.values_mut() {
            if buffer.key().config_id == config_id {
                buffer.set_rate_sequence(category, rates.clone())?;
                changed += 1;
            }
        }
        state.injectors.insert(config_id, updated);
        info!(config_id, %category, buffers = changed, "rates changed");
        Ok(changed)
    }

    pub fn current_period(&self) -> u64 {
        self.state.lock().current_period
    }

    pub fn set_injection_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        debug!(enabled, "injection toggled");
        state.injection_enabled = enabled;
    }

    /// Add `delta` to the injection level and return the new level
    pub fn adjust_injection_level(&self, delta: i64) -> i64 {
        let mut state = self.state.lock();
        state.injection_level = state.injection_level.saturating_add(delta);
        debug!(level = state.injection_level, "injection level changed");
        state.injection_level
    }

    pub fn injection_level(&self) -> i64 {
        self.state.lock().injection_level
    }

    pub fn on_read(&self, address: u64, size: usize) {
        let mut state = self.state.lock();
        let inject = state.should_inject();
        state.access(address, size, AccessType::Read, inject);
    }

    pub fn on_write(&self, address: u64, size: usize) {
        let mut state = self.state.lock();
        let inject = state.should_inject();
        state.access(address, size, AccessType::Write, inject);
    }

    /// Gathered read of `element_size` bytes at each address
    pub fn on_scattered_read(&self, addresses: &[u64], element_size: usize) {
        self.scattered(addresses, element_size, AccessType::Read);
    }

    /// Scattered write of `element_size` bytes at each address
    pub fn on_scattered_write(&self, addresses: &[u64], element_size: usize) {
        self.scattered(addresses, element_size, AccessType::Write);
    }

    fn scattered(&self, addresses: &[u64], element_size: usize, access: AccessType) {
        let mut state = self.state.lock();
        let inject = state.should_inject();
        for &address in addresses {
            state.access(address, element_size, access, inject);
        }
    }

    /// Run `f` on the simulated memory, under the engine lock
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut dyn AddressSpace) -> R) -> R {
        let mut state = self.state.lock();
        f(state.memory.as_mut())
    }

    /// Diagnostics of every known buffer whose range intersects `range`
    pub fn diagnostics(&self, range: Range) -> Vec<BufferDiagnostics> {
        let state = self.state.lock();
        state
            .buffers
            .values()
            .filter(|buffer| buffer.range().intersects(&range))
            .map(ApproximateBuffer::diagnostics)
            .collect()
    }

    pub fn active_buffers(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn report(&self) -> EngineReport {
        let state = self.state.lock();
        EngineReport::new(
            state.current_period,
            &state.config,
            state.buffers.values(),
            &state.consumption,
        )
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tests::CERTAIN;
    use crate::config::BufferKind;
    use crate::memory::FlatMemory;

    const BASE: u64 = 0x1000;

    fn engine_with(config: EngineConfig, write: f64) -> Engine {
        let injector = InjectorConfiguration::new(
            7,
            ErrorRate::ZERO,
            ErrorRate::Probability(write),
            ErrorRate::ZERO,
        );
        Engine::new(config, vec![injector], Box::new(FlatMemory::new(BASE, 256))).unwrap()
    }

    fn armed(buffer: BufferKind) -> EngineConfig {
        EngineConfig {
            buffer,
            injection_level: 1,
            seed: Some(3),
            ..EngineConfig::default()
        }
    }

    fn range(start: u64, end: u64) -> Range {
        Range::new(start, end).unwrap()
    }

    #[test]
    fn test_unknown_configuration_is_an_error() {
        let engine = engine_with(armed(BufferKind::LongTerm), 0.0);
        let result = engine.register_buffer(range(BASE, BASE + 16), 1, 99, 4);
        assert!(matches!(result, Err(ApproxError::UnknownConfiguration(99))));
        assert_eq!(engine.active_buffers(), 0);
    }

    #[test]
    fn test_overlap_is_ignored() {
        let engine = engine_with(armed(BufferKind::LongTerm), 0.0);
        assert_eq!(
            engine.register_buffer(range(BASE, BASE + 16), 1, 7, 4).unwrap(),
            Registration::Created
        );
        assert_eq!(
            engine.register_buffer(range(BASE + 8, BASE + 32), 2, 7, 4).unwrap(),
            Registration::Ignored
        );
        assert_eq!(
            engine.register_buffer(range(BASE, BASE + 16), 1, 7, 4).unwrap(),
            Registration::Ignored
        );
        assert_eq!(
            engine.register_buffer(range(BASE + 16, BASE + 32), 2, 7, 4).unwrap(),
            Registration::Created
        );
        assert_eq!(engine.active_buffers(), 2);
    }

    #[test]
    fn test_shared_registration_counts_references() {
        let config = EngineConfig {
            shared_registration: true,
            ..armed(BufferKind::ShortTerm)
        };
        let engine = engine_with(config, 0.0);
        let r = range(BASE, BASE + 16);
        engine.register_buffer(r, 1, 7, 4).unwrap();
        assert_eq!(engine.register_buffer(r, 1, 7, 4).unwrap(), Registration::Shared);

        assert_eq!(engine.unregister_buffer(r, true), Unregistration::Released);
        assert_eq!(engine.active_buffers(), 1);
        assert_eq!(engine.unregister_buffer(r, true), Unregistration::Retired);
        assert_eq!(engine.unregister_buffer(r, true), Unregistration::NotFound);
    }

    #[test]
    fn test_reactivation_keeps_identity() {
        let engine = engine_with(armed(BufferKind::LongTerm), 0.0);
        let r = range(BASE, BASE + 16);
        engine.register_buffer(r, 1, 7, 4).unwrap();
        engine.on_read(BASE, 4);
        engine.unregister_buffer(r, true);
        engine.advance_period(3);

        assert_eq!(engine.register_buffer(r, 1, 7, 4).unwrap(), Registration::Reactivated);
        let diagnostics = engine.diagnostics(r);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].activations, 2);
        assert_eq!(diagnostics[0].current_period, 3);
        assert_eq!(diagnostics[0].archived_periods, 1);

        // A different element size is a different buffer.
        engine.unregister_buffer(r, true);
        assert_eq!(engine.register_buffer(r, 1, 7, 2).unwrap(), Registration::Created);
        assert_eq!(engine.diagnostics(r).len(), 2);
    }

    #[test]
    fn test_injection_needs_level_and_enable() {
        let mut config = armed(BufferKind::LongTerm);
        config.injection_level = 0;
        let engine = engine_with(config, CERTAIN);
        engine.register_buffer(range(BASE, BASE + 4), 1, 7, 1).unwrap();

        engine.on_write(BASE, 1);
        engine.on_read(BASE, 1);
        assert_eq!(engine.adjust_injection_level(2), 2);
        engine.set_injection_enabled(false);
        engine.on_write(BASE + 1, 1);
        engine.on_read(BASE + 1, 1);
        engine.set_injection_enabled(true);
        engine.on_write(BASE + 2, 1);
        engine.on_read(BASE + 2, 1);

        let bytes = engine.with_memory(|memory| memory.bytes_mut(BASE, 4).map(|b| b.to_vec()));
        assert_eq!(bytes, Some(vec![0, 0, 0xff, 0]));
    }

    #[test]
    fn test_access_spanning_two_buffers() {
        let engine = engine_with(armed(BufferKind::ShortTerm), CERTAIN);
        engine.register_buffer(range(BASE, BASE + 4), 1, 7, 2).unwrap();
        engine.register_buffer(range(BASE + 4, BASE + 8), 2, 7, 2).unwrap();

        engine.on_write(BASE + 2, 4);
        let pending: Vec<usize> = engine
            .diagnostics(range(BASE, BASE + 8))
            .iter()
            .map(|d| d.pending.pending_writes)
            .collect();
        assert_eq!(pending, vec![1, 1]);
    }

    #[test]
    fn test_pool_round_trip_through_engine() {
        let engine = engine_with(armed(BufferKind::LongTerm), 0.0);
        engine.register_buffer(range(BASE, BASE + 64), 1, 7, 8).unwrap();
        engine.unregister_buffer(range(BASE, BASE + 64), true);
        assert_eq!(engine.with_state(|state| state.pool.statuses.available(8)), 1);

        engine.register_buffer(range(BASE + 64, BASE + 128), 2, 7, 8).unwrap();
        assert_eq!(engine.with_state(|state| state.pool.statuses.available(8)), 0);
    }

    #[test]
    fn test_set_rates_reaches_existing_buffers() {
        let engine = engine_with(armed(BufferKind::LongTerm), 0.0);
        engine.register_buffer(range(BASE, BASE + 2), 1, 7, 1).unwrap();

        let changed = engine
            .set_rates(7, ErrorCategory::Write, vec![ErrorRate::Probability(CERTAIN)])
            .unwrap();
        assert_eq!(changed, 1);
        engine.on_write(BASE, 1);
        engine.on_read(BASE, 1);

        let bytes = engine.with_memory(|memory| memory.bytes_mut(BASE, 2).map(|b| b.to_vec()));
        assert_eq!(bytes, Some(vec![0xff, 0]));
        assert!(matches!(
            engine.set_rates(8, ErrorCategory::Read, vec![ErrorRate::ZERO]),
            Err(ApproxError::UnknownConfiguration(8))
        ));
        assert!(engine
            .set_rates(7, ErrorCategory::Read, vec![ErrorRate::Probability(2.0)])
            .is_err());
    }

    #[test]
    fn test_set_rates_spares_pending_writes() {
        for kind in [BufferKind::ShortTerm, BufferKind::LongTerm] {
            let engine = engine_with(armed(kind), CERTAIN);
            engine.register_buffer(range(BASE, BASE + 1), 1, 7, 1).unwrap();

            engine.on_write(BASE, 1);
            engine.set_rates(7, ErrorCategory::Write, vec![ErrorRate::ZERO]).unwrap();
            engine.on_read(BASE, 1);

            let bytes = engine.with_memory(|memory| memory.bytes_mut(BASE, 1).map(|b| b.to_vec()));
            assert_eq!(bytes, Some(vec![0xff]), "{kind:?}");
        }
    }

    #[test]
    fn test_default_config_injects() {
        let config = EngineConfig {
            seed: Some(1),
            ..EngineConfig::default()
        };
        let engine = engine_with(config, CERTAIN);
        engine.register_buffer(range(BASE, BASE + 1), 1, 7, 1).unwrap();
        engine.on_write(BASE, 1);
        engine.on_read(BASE, 1);

        let bytes = engine.with_memory(|memory| memory.bytes_mut(BASE, 1).map(|b| b.to_vec()));
        assert_eq!(bytes, Some(vec![0xff]));
    }

    #[test]
    fn test_period_moves_forward_only() {
        let engine = engine_with(armed(BufferKind::LongTerm), 0.0);
        engine.register_buffer(range(BASE, BASE + 8), 1, 7, 1).unwrap();
        engine.advance_period(2);
        engine.advance_period(2);
        assert_eq!(engine.current_period(), 2);
        let diagnostics = engine.diagnostics(range(BASE, BASE + 8));
        assert_eq!(diagnostics[0].archived_periods, 1);
    }
}
