//! File output for simulation runs.

pub mod export;
