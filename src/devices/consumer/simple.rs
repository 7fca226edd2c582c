use chrono::NaiveDateTime;

use super::{Behavior, ConsumerBase, ConsumerState};
use crate::entity::{Command, EntityEvent, EntityId};

/// An on/off socket. Running means the socket reports on.
#[derive(Debug, Clone)]
pub struct SimpleConsumer {
    socket: EntityId,
    socket_on: bool,
}

impl SimpleConsumer {
    pub fn new(socket: impl Into<EntityId>) -> Self {
        Self {
            socket: socket.into(),
            socket_on: false,
        }
    }

    pub fn socket(&self) -> &EntityId {
        &self.socket
    }
}

impl Behavior for SimpleConsumer {
    fn watches(&self, entity: &EntityId) -> bool {
        *entity == self.socket
    }

    fn observe(&mut self, event: &EntityEvent) {
        if let Some(on) = event.bool_for(&self.socket) {
            self.socket_on = on;
        }
    }

    fn is_running(&self) -> bool {
        self.socket_on
    }

    fn desired_state(&self, base: &ConsumerBase, now: NaiveDateTime) -> ConsumerState {
        base.generic_desired_state(self.socket_on, true, now)
    }

    fn turn_on(&mut self) -> Vec<Command> {
        vec![Command::TurnOn(self.socket.clone())]
    }

    fn turn_off(&mut self) -> Vec<Command> {
        vec![Command::TurnOff(self.socket.clone())]
    }
}
