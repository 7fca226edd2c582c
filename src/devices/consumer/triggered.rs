use chrono::NaiveDateTime;

use super::{Behavior, ConsumerBase, ConsumerState};
use crate::entity::{Command, EntityEvent, EntityId};

/// An appliance that reports its own program state (e.g. a washing machine).
///
/// The appliance signals readiness with `start_state`; switching the socket
/// on lets it run through its phases. Each phase has its own peak draw.
#[derive(Debug, Clone)]
pub struct TriggeredConsumer {
    state_entity: EntityId,
    socket: EntityId,
    start_state: String,
    critical_state: Option<String>,
    /// Ordered `(reported state, peak load W)` table.
    phases: Vec<(String, f64)>,
    can_force_shutdown: bool,
    reported: Option<String>,
    socket_on: bool,
}

impl TriggeredConsumer {
    pub fn new(
        state_entity: impl Into<EntityId>,
        socket: impl Into<EntityId>,
        start_state: impl Into<String>,
        critical_state: Option<String>,
        phases: Vec<(String, f64)>,
        can_force_shutdown: bool,
    ) -> Self {
        Self {
            state_entity: state_entity.into(),
            socket: socket.into(),
            start_state: start_state.into(),
            critical_state,
            phases,
            can_force_shutdown,
            reported: None,
            socket_on: false,
        }
    }

    /// Last reported appliance state.
    pub fn reported_state(&self) -> Option<&str> {
        self.reported.as_deref()
    }

    fn is_reported(&self, state: &str) -> bool {
        self.reported.as_deref() == Some(state)
    }

    /// Highest peak among the phases up to and including the reported one.
    ///
    /// Later phases may draw more than earlier ones, so the scan keeps the
    /// maximum seen. An unlisted state yields the maximum of the whole table.
    fn phase_peak(&self) -> Option<f64> {
        if self.phases.is_empty() {
            return None;
        }

        let mut max_seen = 0.0_f64;
        for (state, peak) in &self.phases {
            max_seen = max_seen.max(*peak);
            if self.is_reported(state) {
                return Some(max_seen);
            }
        }
        Some(max_seen)
    }
}

impl Behavior for TriggeredConsumer {
    fn watches(&self, entity: &EntityId) -> bool {
        *entity == self.state_entity || *entity == self.socket
    }

    fn observe(&mut self, event: &EntityEvent) {
        if event.entity == self.state_entity {
            self.reported = event.value.as_text().map(str::to_string);
        }
        if let Some(on) = event.bool_for(&self.socket) {
            self.socket_on = on;
        }
    }

    fn is_running(&self) -> bool {
        if self.phases.is_empty() {
            return self.socket_on;
        }
        self.phases.iter().any(|(state, _)| self.is_reported(state))
    }

    fn desired_state(&self, base: &ConsumerBase, now: NaiveDateTime) -> ConsumerState {
        if self.is_running() {
            return ConsumerState::Running;
        }

        let critical_reported = self
            .critical_state
            .as_deref()
            .is_some_and(|s| self.is_reported(s));
        let ready = self.is_reported(&self.start_state);

        if critical_reported || (ready && base.critical_condition(now)) {
            ConsumerState::CriticallyNeedsEnergy
        } else if ready && base.in_time_window(now) && base.min_timeout_elapsed(now) {
            ConsumerState::NeedsEnergy
        } else {
            ConsumerState::Off
        }
    }

    fn peak_load(&self, base: &ConsumerBase) -> f64 {
        self.phase_peak().unwrap_or(base.settings().peak_load)
    }

    fn allows_force_stop(&self) -> bool {
        self.can_force_shutdown
    }

    fn allows_force_stop_on_peak_load(&self) -> bool {
        self.can_force_shutdown
    }

    fn turn_on(&mut self) -> Vec<Command> {
        vec![Command::TurnOn(self.socket.clone())]
    }

    fn turn_off(&mut self) -> Vec<Command> {
        vec![Command::TurnOff(self.socket.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::consumer::{Consumer, ConsumerEvent, ConsumerKind, ConsumerSettings};
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .and_then(|d| d.and_hms_opt(14, 0, 0))
            .expect("valid timestamp")
    }

    fn washer(can_force_shutdown: bool) -> Consumer {
        Consumer::new(
            "washer",
            ConsumerSettings {
                peak_load: 2000.0,
                ..ConsumerSettings::default()
            },
            ConsumerKind::Triggered(TriggeredConsumer::new(
                "sensor.washer_state",
                "switch.washer",
                "ready",
                Some("deadline".to_string()),
                vec![
                    ("prewash".to_string(), 300.0),
                    ("heating".to_string(), 2200.0),
                    ("washing".to_string(), 400.0),
                    ("spinning".to_string(), 600.0),
                ],
                can_force_shutdown,
            )),
        )
    }

    fn report(c: &mut Consumer, state: &str) -> Vec<ConsumerEvent> {
        c.deliver(&EntityEvent::text("sensor.washer_state", state));
        c.process(now())
    }

    #[test]
    fn ready_state_requests_start() {
        let mut c = washer(false);
        let events = report(&mut c, "ready");
        assert_eq!(c.state(), ConsumerState::NeedsEnergy);
        assert_eq!(events, vec![ConsumerEvent::StartRequested]);

        report(&mut c, "deadline");
        assert_eq!(c.state(), ConsumerState::CriticallyNeedsEnergy);
    }

    #[test]
    fn peak_keeps_maximum_of_earlier_phases() {
        let mut c = washer(false);
        report(&mut c, "prewash");
        assert_eq!(c.peak_load(), 300.0);
        report(&mut c, "washing");
        assert_eq!(c.peak_load(), 2200.0);
        assert!(c.is_running());
    }

    #[test]
    fn unlisted_state_uses_table_maximum() {
        let mut c = washer(false);
        report(&mut c, "idle");
        assert_eq!(c.peak_load(), 2200.0);
        assert!(!c.is_running());
    }

    #[test]
    fn force_stop_requires_flag() {
        let mut locked = washer(false);
        report(&mut locked, "washing");
        assert!(!locked.can_force_stop(now()));
        assert!(!locked.can_force_stop_on_peak_load(now()));

        let mut free = washer(true);
        report(&mut free, "washing");
        assert!(free.can_force_stop(now()));
    }
}
