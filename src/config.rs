//! Engine and injector configuration
//!
//! Feature switches are runtime values: one [`EngineConfig`] chooses the
//! injector strategy, the buffer strategy and the optional layers for the
//! whole run. [`InjectorConfiguration`]s carry the per-configuration bit depth
//! and rates, and a [`SimulationFile`] bundles everything loaded from TOML.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::ber::{BitErrorConfig, ErrorCategory, ErrorRate};
use crate::energy::ConsumptionProfile;
use crate::ApproxError;

/// Fault injection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectorKind {
    #[default]
    Default,
    Granular,
    DistanceBased,
}

/// When pending faults are materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Deferred until the next access, kept in address-ordered maps
    ShortTerm,
    /// Tracked per element in flat arrays
    #[default]
    LongTerm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub injector: InjectorKind,
    pub buffer: BufferKind,
    /// Charge decay for the periods data sits untouched
    pub passive_injection: bool,
    /// Allow rate sequences that rotate per period
    pub multiple_ber: bool,
    /// Count flips per bit position in every period log
    pub log_faults: bool,
    /// Apply accumulated passive rates above one as whole flips
    pub overcharge_flip_back: bool,
    /// Re-registering an active range bumps its refcount instead of being ignored
    pub shared_registration: bool,
    pub initial_period: u64,
    /// Access faults are injected only while the level is non-zero; the
    /// default of 1 injects from the start, and nested `level -1`/`level 1`
    /// pairs suspend it for a region
    pub injection_level: i64,
    pub injection_enabled: bool,
    /// Fixed seed for reproducible runs; entropy when absent
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            injector: InjectorKind::Default,
            buffer: BufferKind::LongTerm,
            passive_injection: false,
            multiple_ber: true,
            log_faults: true,
            overcharge_flip_back: true,
            shared_registration: false,
            initial_period: 0,
            injection_level: 1,
            injection_enabled: true,
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Warn about switch combinations that have no effect
    pub fn validate(&self) -> Result<(), ApproxError> {
        if self.injection_level != 0 && !self.injection_enabled {
            tracing::warn!(
                level = self.injection_level,
                "injection level is set but injection starts disabled"
            );
        }
        if self.injector == InjectorKind::DistanceBased && !self.overcharge_flip_back {
            tracing::warn!("overcharge_flip_back is ignored by the distance based injector");
        }
        Ok(())
    }
}

/// Bit depth and rates of one configuration id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectorConfiguration {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "default_bit_depth")]
    pub bit_depth: usize,
    #[serde(default = "zero_rates", deserialize_with = "one_or_many")]
    pub read: Vec<ErrorRate>,
    #[serde(default = "zero_rates", deserialize_with = "one_or_many")]
    pub write: Vec<ErrorRate>,
    #[serde(default = "zero_rates", deserialize_with = "one_or_many")]
    pub passive: Vec<ErrorRate>,
}

fn default_bit_depth() -> usize {
    8
}

fn zero_rates() -> Vec<ErrorRate> {
    vec![ErrorRate::ZERO]
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<ErrorRate>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<ErrorRate>),
        One(ErrorRate),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(rates) => rates,
        OneOrMany::One(rate) => vec![rate],
    })
}

impl InjectorConfiguration {
    /// Constant rates with the default bit depth
    pub fn new(id: i64, read: ErrorRate, write: ErrorRate, passive: ErrorRate) -> Self {
        Self {
            id,
            bit_depth: default_bit_depth(),
            read: vec![read],
            write: vec![write],
            passive: vec![passive],
        }
    }

    pub fn with_bit_depth(mut self, bit_depth: usize) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    pub fn rates(&self, category: ErrorCategory) -> &[ErrorRate] {
        match category {
            ErrorCategory::Read => &self.read,
            ErrorCategory::Write => &self.write,
            ErrorCategory::Passive => &self.passive,
        }
    }

    /// Per-buffer rate view anchored at `creation_period`
    pub fn bit_error_config(&self, creation_period: u64) -> Result<BitErrorConfig, ApproxError> {
        BitErrorConfig::new(
            ErrorCategory::ALL.map(|category| self.rates(category).to_vec()),
            creation_period,
        )
    }

    pub fn validate(&self, engine: &EngineConfig) -> Result<(), ApproxError> {
        let invalid = |reason: String| {
            ApproxError::InvalidConfig(format!("configuration {}: {reason}", self.id))
        };

        if self.bit_depth == 0 {
            return Err(invalid("bit depth must be greater than zero".to_string()));
        }

        self.bit_error_config(0).map_err(|e| invalid(e.to_string()))?;

        for category in ErrorCategory::ALL {
            let rates = self.rates(category);

            if !engine.multiple_ber && rates.len() > 1 {
                return Err(invalid(format!(
                    "{category} has {} rates but multiple_ber is disabled",
                    rates.len()
                )));
            }

            for rate in rates {
                match rate {
                    ErrorRate::Distance { .. } if engine.injector != InjectorKind::DistanceBased => {
                        return Err(invalid(format!(
                            "{category} uses a distance model without the distance based injector"
                        )));
                    }
                    ErrorRate::Probability(_) | ErrorRate::PerBit(_)
                        if engine.injector == InjectorKind::DistanceBased && !rate.is_disabled() =>
                    {
                        return Err(invalid(format!(
                            "{category} needs a distance model with the distance based injector"
                        )));
                    }
                    ErrorRate::PerBit(bits) if bits.len() != self.bit_depth => {
                        return Err(invalid(format!(
                            "{category} per-bit rates have {} entries for bit depth {}",
                            bits.len(),
                            self.bit_depth
                        )));
                    }
                    ErrorRate::PerBit(_) if engine.injector == InjectorKind::Granular => {
                        return Err(invalid(format!(
                            "{category} per-bit rates need the default injector"
                        )));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

/// Simulated address space backing the replayed program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub base: u64,
    pub size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base: 0x1000,
            size: 1 << 20,
        }
    }
}

/// Everything a simulation run reads from its configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationFile {
    pub engine: EngineConfig,
    pub memory: MemoryConfig,
    pub injectors: Vec<InjectorConfiguration>,
    pub consumption: Vec<ConsumptionProfile>,
}

impl SimulationFile {
    pub fn from_toml_str(raw: &str) -> Result<Self, ApproxError> {
        let file: SimulationFile = toml::from_str(raw)?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, ApproxError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ApproxError> {
        self.engine.validate()?;

        if self.injectors.is_empty() {
            return Err(ApproxError::InvalidConfig(
                "at least one injector configuration is required".to_string(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for injector in &self.injectors {
            if !seen.insert(injector.id) {
                return Err(ApproxError::InvalidConfig(format!(
                    "duplicate injector configuration id {}",
                    injector.id
                )));
            }
            injector.validate(&self.engine)?;
        }

        for profile in &self.consumption {
            profile.validate()?;
        }

        if self.memory.size == 0 {
            return Err(ApproxError::InvalidConfig(
                "memory size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
