//! Household peak-capacity load manager.
//!
//! Keeps grid import under a contracted peak by admitting, throttling and
//! shedding controllable consumers based on live sensor events.

pub mod cli;
pub mod config;
pub mod devices;
/// Orchestrator, admission pass, capacity monitor and timers.
pub mod engine;
pub mod entity;
pub mod household;
pub mod io;
pub mod report;
pub mod store;
pub mod time_window;
