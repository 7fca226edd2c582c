//! Recurring daily time windows.

use chrono::{Datelike, NaiveDateTime, NaiveTime, TimeDelta, Weekday};

use crate::entity::EntityId;

/// A daily interval such as `22:00-02:00`, optionally restricted to certain
/// weekdays and gated by an external binary signal.
///
/// Windows where `start > end` span midnight.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
    days: Vec<Weekday>,
    gate: Option<EntityId>,
    invert_gate: bool,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            days: Vec::new(),
            gate: None,
            invert_gate: false,
        }
    }

    /// Restricts the window to the given weekdays.
    pub fn on_days(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.days = days.into_iter().collect();
        self
    }

    /// Only active while `gate` reports on (or off, when `invert` is set).
    pub fn gated_by(mut self, gate: EntityId, invert: bool) -> Self {
        self.gate = Some(gate);
        self.invert_gate = invert;
        self
    }

    pub fn gate(&self) -> Option<&EntityId> {
        self.gate.as_ref()
    }

    /// Returns `true` when `now` falls inside the window.
    ///
    /// `gate_state` is the last known value of the gating signal; an unknown
    /// signal counts as inactive when a gate is configured.
    pub fn is_active(&self, now: NaiveDateTime, gate_state: Option<bool>) -> bool {
        if self.gate.is_some() {
            let open = gate_state.is_some_and(|on| on != self.invert_gate);
            if !open {
                return false;
            }
        }

        if !self.days.is_empty() && !self.days.contains(&now.weekday()) {
            return false;
        }

        let (start, end) = self.bounds(now);
        start <= now && now <= end
    }

    /// End instant of the occurrence of this window that contains `now`.
    pub fn window_end(&self, now: NaiveDateTime) -> NaiveDateTime {
        self.bounds(now).1
    }

    /// Time left in the current occurrence, zero when `now` is past its end.
    pub fn remaining(&self, now: NaiveDateTime) -> TimeDelta {
        (self.window_end(now) - now).max(TimeDelta::zero())
    }

    fn bounds(&self, now: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        let date = now.date();
        let mut start = date.and_time(self.start);
        let mut end = date.and_time(self.end);

        if start > end {
            // spans midnight: pick the occurrence that can contain `now`
            if now >= start {
                end += TimeDelta::days(1);
            } else {
                start -= TimeDelta::days(1);
            }
        }

        (start, end)
    }
}
