//! Household simulation used to exercise the orchestrator end to end.
//!
//! The house only talks entity events and commands, exactly like a real
//! home-automation host would.

pub mod home;
pub mod kpi;
pub mod profile;
pub mod runner;

pub use home::{HomeSample, SimulatedHome};
pub use kpi::{CommandCounts, KpiReport};
pub use runner::{SimulationResult, TelemetryRow, run_simulation};
