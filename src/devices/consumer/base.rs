//! Bookkeeping shared by every consumer variant: thresholds, run-time and
//! timeout policies, time windows and start/stop timestamps.

use std::collections::HashMap;

use chrono::{NaiveDateTime, TimeDelta};

use super::ConsumerState;
use crate::engine::clock::TimerHandle;
use crate::entity::{EntityEvent, EntityId};
use crate::time_window::TimeWindow;

/// An actuation is considered lost if not confirmed within this many seconds.
pub const PENDING_ACTUATION_TIMEOUT_SECS: i64 = 120;

/// Static, configuration-derived consumer parameters.
#[derive(Debug, Clone, Default)]
pub struct ConsumerSettings {
    /// Measured power draw of the consumer (W).
    pub power_entity: Option<EntityId>,
    /// Maximum draw once running (W).
    pub peak_load: f64,
    /// Net grid load at or below which the consumer may be started (W).
    pub switch_on_load: f64,
    /// Net grid load above which the consumer should be shed (W).
    pub switch_off_load: f64,
    pub min_runtime: Option<TimeDelta>,
    pub max_runtime: Option<TimeDelta>,
    /// Minimum pause after a run before starting again.
    pub min_timeout: Option<TimeDelta>,
    /// Maximum pause after a run before the consumer becomes critical.
    pub max_timeout: Option<TimeDelta>,
    pub time_windows: Vec<TimeWindow>,
    /// External "critically needed" flag.
    pub critically_needed: Option<EntityId>,
    /// Groups whose dynamic consumers may throttle on this consumer's behalf.
    pub groups: Vec<String>,
}

/// Actuation sent but not yet confirmed by a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuation {
    Start,
    Stop,
}

#[derive(Debug)]
pub struct ConsumerBase {
    pub(super) name: String,
    pub(super) settings: ConsumerSettings,
    pub(super) state: ConsumerState,
    pub(super) started_at: Option<NaiveDateTime>,
    pub(super) last_run: Option<NaiveDateTime>,
    pub(super) planned_stop: Option<NaiveDateTime>,
    pub(super) stop_timer: Option<TimerHandle>,
    pub(super) pending: Option<(Actuation, NaiveDateTime)>,
    pub(super) physically_running: bool,
    power_w: Option<f64>,
    critically_needed: bool,
    gates: HashMap<EntityId, bool>,
}

impl ConsumerBase {
    pub fn new(name: String, settings: ConsumerSettings) -> Self {
        Self {
            name,
            settings,
            state: ConsumerState::Unknown,
            started_at: None,
            last_run: None,
            planned_stop: None,
            stop_timer: None,
            pending: None,
            physically_running: false,
            power_w: None,
            critically_needed: false,
            gates: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.started_at
    }

    pub fn last_run(&self) -> Option<NaiveDateTime> {
        self.last_run
    }

    /// Last measured draw, if a power sensor is configured and has reported.
    pub fn power_w(&self) -> Option<f64> {
        self.power_w
    }

    pub fn watches(&self, entity: &EntityId) -> bool {
        let s = &self.settings;
        s.power_entity.as_ref() == Some(entity)
            || s.critically_needed.as_ref() == Some(entity)
            || s.time_windows.iter().any(|w| w.gate() == Some(entity))
    }

    pub fn observe(&mut self, event: &EntityEvent) {
        if let Some(entity) = &self.settings.power_entity {
            if let Some(w) = event.number_for(entity) {
                self.power_w = Some(w);
            }
        }
        if let Some(entity) = &self.settings.critically_needed {
            if let Some(on) = event.bool_for(entity) {
                self.critically_needed = on;
            }
        }
        for window in &self.settings.time_windows {
            if let Some(gate) = window.gate() {
                if let Some(on) = event.bool_for(gate) {
                    self.gates.insert(gate.clone(), on);
                }
            }
        }
    }

    pub fn critically_needed(&self) -> bool {
        self.critically_needed
    }

    fn gate_state(&self, window: &TimeWindow) -> Option<bool> {
        window.gate().and_then(|g| self.gates.get(g).copied())
    }

    /// First configured window active at `now`.
    pub fn active_window(&self, now: NaiveDateTime) -> Option<&TimeWindow> {
        self.settings
            .time_windows
            .iter()
            .find(|w| w.is_active(now, self.gate_state(w)))
    }

    /// `true` when no windows are configured or one of them is active.
    pub fn in_time_window(&self, now: NaiveDateTime) -> bool {
        self.settings.time_windows.is_empty() || self.active_window(now).is_some()
    }

    pub fn min_timeout_elapsed(&self, now: NaiveDateTime) -> bool {
        match (self.settings.min_timeout, self.last_run) {
            (Some(timeout), Some(last_run)) => now - last_run >= timeout,
            _ => true,
        }
    }

    pub fn max_timeout_elapsed(&self, now: NaiveDateTime) -> bool {
        match (self.settings.max_timeout, self.last_run) {
            (Some(timeout), Some(last_run)) => now - last_run >= timeout,
            _ => false,
        }
    }

    pub fn min_runtime_elapsed(&self, now: NaiveDateTime) -> bool {
        match (self.settings.min_runtime, self.started_at) {
            (Some(runtime), Some(started_at)) => now - started_at >= runtime,
            _ => true,
        }
    }

    /// External flag on, or the maximum pause since the last run has passed.
    pub fn critical_condition(&self, now: NaiveDateTime) -> bool {
        self.critically_needed || self.max_timeout_elapsed(now)
    }

    /// Desired state shared by the socket-like variants.
    ///
    /// `wants_power` is the variant's own demand signal.
    pub fn generic_desired_state(
        &self,
        running: bool,
        wants_power: bool,
        now: NaiveDateTime,
    ) -> ConsumerState {
        let critical = self.critical_condition(now);
        if running {
            if !critical && !self.in_time_window(now) {
                ConsumerState::Off
            } else {
                ConsumerState::Running
            }
        } else if critical && wants_power {
            ConsumerState::CriticallyNeedsEnergy
        } else if wants_power && self.min_timeout_elapsed(now) && self.in_time_window(now) {
            ConsumerState::NeedsEnergy
        } else {
            ConsumerState::Off
        }
    }

    /// Remaining run-time before the consumer must stop, `None` when unbounded.
    ///
    /// Bounded by the end of the active window and by the maximum run-time,
    /// both measured from `started_at`. Never grows past the first value
    /// handed out during the same run.
    pub fn run_time(&mut self, now: NaiveDateTime) -> Option<TimeDelta> {
        let started_at = self.started_at.unwrap_or(now);

        let window_limit = self
            .active_window(now)
            .map(|w| w.window_end(now) - started_at);
        let limit = match (window_limit, self.settings.max_runtime) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }?;

        let mut remaining = (limit - (now - started_at)).max(TimeDelta::zero());
        if let Some(planned_stop) = self.planned_stop {
            remaining = remaining.min((planned_stop - now).max(TimeDelta::zero()));
        } else {
            self.planned_stop = Some(now + remaining);
        }
        Some(remaining)
    }

    pub fn pending(&self, now: NaiveDateTime) -> Option<Actuation> {
        self.pending
            .filter(|(_, at)| now - *at < TimeDelta::seconds(PENDING_ACTUATION_TIMEOUT_SECS))
            .map(|(actuation, _)| actuation)
    }
}
