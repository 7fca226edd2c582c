//! Admission/eviction engine: grid monitor, scheduler, orchestrator and the
//! per-pass decision algorithm.

mod admission;
pub mod clock;
pub mod monitor;
pub mod orchestrator;
pub mod types;

pub use clock::{Scheduler, SystemScheduler, Timer, TimerHandle, VirtualScheduler};
pub use monitor::{CapacityMonitor, GridEntities, MIN_PEAK_LOAD_W};
pub use orchestrator::Orchestrator;
pub use types::{EngineSettings, PassOutcome};
