//! approxmem - unreliable memory simulation
//!
//! Registered byte ranges behave like approximate storage: reads, writes and
//! the mere passage of time flip bits according to per-range bit error rates.
//! An instrumented program reports its memory traffic to an [`Engine`], which
//! decides per access whether and where faults land, and keeps per-period
//! access and fault statistics for energy and quality analysis.

pub mod ber;
pub mod buffer;
pub mod config;
pub mod energy;
pub mod engine;
pub mod injector;
pub mod memory;
pub mod period_log;
pub mod pool;
pub mod range;
pub mod report;

use thiserror::Error;

use crate::ber::ErrorCategory;

// Re-export main types
pub use ber::{BitErrorConfig, ErrorRate};
pub use buffer::{ApproximateBuffer, BufferKey};
pub use config::{BufferKind, EngineConfig, InjectorConfiguration, InjectorKind, SimulationFile};
pub use engine::{Engine, Registration, Unregistration};
pub use injector::FaultInjector;
pub use memory::{AddressSpace, FlatMemory};
pub use period_log::{AccessType, PeriodLog};
pub use range::Range;
pub use report::EngineReport;

#[derive(Debug, Error)]
pub enum ApproxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid range: start {start:#x} is past end {end:#x}")]
    InvalidRange { start: u64, end: u64 },
    #[error("{category} rate {value} is outside [0, 1)")]
    RateOutOfRange { category: ErrorCategory, value: f64 },
    #[error("buffer {buffer_id}: {reason}")]
    InvalidBuffer { buffer_id: i64, reason: String },
    #[error("unknown injector configuration id {0}")]
    UnknownConfiguration(i64),
}
