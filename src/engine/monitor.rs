//! Grid connection monitor: current and rolling-average net load against the
//! contracted peak.
//!
//! Net load convention:
//! - Positive values mean importing from the grid
//! - Negative values mean exporting (solar surplus)

use std::collections::VecDeque;

use chrono::{NaiveDateTime, TimeDelta};

use crate::entity::{EntityEvent, EntityId};

/// Contracted peak floor in watts. Protects against a zero or missing
/// peak sensor admitting everything.
pub const MIN_PEAK_LOAD_W: f64 = 2500.0;

/// Default number of samples kept per direction.
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Fixed-capacity, time-ordered sample buffer. Oldest samples are evicted first.
#[derive(Debug, Clone)]
pub struct SampleHistory {
    capacity: usize,
    samples: VecDeque<(NaiveDateTime, f64)>,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, at: NaiveDateTime, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, value));
    }

    /// Average of samples taken at or after `since`; `0.0` when there are none.
    pub fn average_since(&self, since: NaiveDateTime) -> f64 {
        let (sum, count) = self
            .samples
            .iter()
            .filter(|(at, _)| *at >= since)
            .fold((0.0, 0usize), |(sum, count), (_, v)| (sum + v, count + 1));

        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Entities the monitor listens to.
#[derive(Debug, Clone)]
pub struct GridEntities {
    /// Instantaneous import power (W).
    pub import: EntityId,
    /// Instantaneous export power (W).
    pub export: EntityId,
    /// Contracted or measured peak import (kW).
    pub peak_import: EntityId,
    pub voltage: Option<EntityId>,
    /// Supplier-reported average demand (W).
    pub average_demand: Option<EntityId>,
}

/// Tracks grid import/export and the contracted peak.
#[derive(Debug, Clone)]
pub struct CapacityMonitor {
    entities: GridEntities,
    import_w: f64,
    export_w: f64,
    peak_import_kw: f64,
    voltage: Option<f64>,
    average_demand_w: Option<f64>,
    import_history: SampleHistory,
    export_history: SampleHistory,
}

impl CapacityMonitor {
    pub fn new(entities: GridEntities, history_capacity: usize) -> Self {
        Self {
            entities,
            import_w: 0.0,
            export_w: 0.0,
            peak_import_kw: 0.0,
            voltage: None,
            average_demand_w: None,
            import_history: SampleHistory::new(history_capacity),
            export_history: SampleHistory::new(history_capacity),
        }
    }

    /// Returns `true` when `entity` is one the monitor reads.
    pub fn watches(&self, entity: &EntityId) -> bool {
        let e = &self.entities;
        *entity == e.import
            || *entity == e.export
            || *entity == e.peak_import
            || e.voltage.as_ref() == Some(entity)
            || e.average_demand.as_ref() == Some(entity)
    }

    /// Applies a sensor change.
    ///
    /// Import/export changes always append a sample; an unusable value repeats
    /// the last valid one.
    pub fn observe(&mut self, event: &EntityEvent, now: NaiveDateTime) {
        let e = &self.entities;
        if event.entity == e.import {
            if let Some(v) = event.value.as_number() {
                self.import_w = v;
            }
            self.import_history.push(now, self.import_w);
        } else if event.entity == e.export {
            if let Some(v) = event.value.as_number() {
                self.export_w = v;
            }
            self.export_history.push(now, self.export_w);
        } else if event.entity == e.peak_import {
            if let Some(v) = event.value.as_number() {
                self.peak_import_kw = v;
            }
        } else if e.voltage.as_ref() == Some(&event.entity) {
            if let Some(v) = event.value.as_number() {
                self.voltage = Some(v);
            }
        } else if e.average_demand.as_ref() == Some(&event.entity) {
            if let Some(v) = event.value.as_number() {
                self.average_demand_w = Some(v);
            }
        }
    }

    /// Net load right now (W).
    pub fn current_load(&self) -> f64 {
        self.import_w - self.export_w
    }

    /// Contracted peak in W, never below [`MIN_PEAK_LOAD_W`].
    pub fn peak_load(&self) -> f64 {
        (self.peak_import_kw * 1000.0).max(MIN_PEAK_LOAD_W)
    }

    /// Average net load over the trailing `window`.
    pub fn average_load_since(&self, now: NaiveDateTime, window: TimeDelta) -> f64 {
        let since = now - window;
        self.import_history.average_since(since) - self.export_history.average_since(since)
    }

    pub fn import_w(&self) -> f64 {
        self.import_w
    }

    pub fn export_w(&self) -> f64 {
        self.export_w
    }

    pub fn voltage(&self) -> Option<f64> {
        self.voltage
    }

    pub fn average_demand(&self) -> Option<f64> {
        self.average_demand_w
    }

    /// Returns `true` when the current load is within the peak.
    pub fn within_peak(&self) -> bool {
        self.current_load() <= self.peak_load()
    }
}
