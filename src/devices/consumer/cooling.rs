use chrono::NaiveDateTime;

use super::{Behavior, ConsumerBase, ConsumerState};
use crate::entity::{Command, EntityEvent, EntityId};

/// A hysteresis-controlled cooling device (fridge, freezer).
///
/// Starts once the temperature reaches `target_temperature`, stops once it
/// falls below it again, and becomes critical at `max_temperature`.
#[derive(Debug, Clone)]
pub struct CoolingConsumer {
    socket: EntityId,
    temperature_entity: EntityId,
    /// Temperature at which cooling is wanted (°C).
    pub target_temperature: f64,
    /// Temperature at which cooling is critical (°C).
    pub max_temperature: f64,
    socket_on: bool,
    temperature: Option<f64>,
}

impl CoolingConsumer {
    /// # Panics
    ///
    /// Panics if `max_temperature` is below `target_temperature`.
    pub fn new(
        socket: impl Into<EntityId>,
        temperature_entity: impl Into<EntityId>,
        target_temperature: f64,
        max_temperature: f64,
    ) -> Self {
        assert!(max_temperature >= target_temperature);

        Self {
            socket: socket.into(),
            temperature_entity: temperature_entity.into(),
            target_temperature,
            max_temperature,
            socket_on: false,
            temperature: None,
        }
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }
}

impl Behavior for CoolingConsumer {
    fn watches(&self, entity: &EntityId) -> bool {
        *entity == self.socket || *entity == self.temperature_entity
    }

    fn observe(&mut self, event: &EntityEvent) {
        if let Some(on) = event.bool_for(&self.socket) {
            self.socket_on = on;
        }
        if let Some(t) = event.number_for(&self.temperature_entity) {
            self.temperature = Some(t);
        }
    }

    fn is_running(&self) -> bool {
        self.socket_on
    }

    fn desired_state(&self, base: &ConsumerBase, now: NaiveDateTime) -> ConsumerState {
        // without a reading, keep whatever the socket is doing
        let Some(temperature) = self.temperature else {
            return if self.socket_on {
                ConsumerState::Running
            } else {
                ConsumerState::Off
            };
        };

        if self.socket_on {
            return if temperature < self.target_temperature {
                ConsumerState::Off
            } else {
                ConsumerState::Running
            };
        }

        if temperature >= self.max_temperature || base.critical_condition(now) {
            ConsumerState::CriticallyNeedsEnergy
        } else if temperature >= self.target_temperature {
            ConsumerState::NeedsEnergy
        } else {
            ConsumerState::Off
        }
    }

    fn allows_force_stop(&self) -> bool {
        self.temperature.is_none_or(|t| t <= self.max_temperature)
    }

    fn turn_on(&mut self) -> Vec<Command> {
        vec![Command::TurnOn(self.socket.clone())]
    }

    fn turn_off(&mut self) -> Vec<Command> {
        vec![Command::TurnOff(self.socket.clone())]
    }
}
