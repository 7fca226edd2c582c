//! Sensor and actuator plumbing shared by every component.
//!
//! The core never reads hardware directly. Hosts publish [`EntityEvent`]s for
//! every state change they observe and drain [`Command`]s to actuate.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an external sensor, switch or set-point (e.g. `switch.fridge`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last reported value of an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityValue {
    Number(f64),
    Binary(bool),
    Text(String),
    /// The source reported no usable value (offline, `unknown`, `unavailable`).
    Unavailable,
}

impl EntityValue {
    /// Numeric view. Text is parsed, binary maps to 0/1.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) if v.is_finite() => Some(*v),
            Self::Number(_) => None,
            Self::Binary(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Self::Unavailable => None,
        }
    }

    /// Binary view. Accepts `on`/`off`, `true`/`false` and `home`/`not_home` text.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Binary(b) => Some(*b),
            Self::Number(v) => Some(*v != 0.0),
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "home" | "yes" => Some(true),
                "off" | "false" | "not_home" | "away" | "no" => Some(false),
                _ => None,
            },
            Self::Unavailable => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A state change observed on an external entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    pub entity: EntityId,
    pub value: EntityValue,
}

impl EntityEvent {
    pub fn number(entity: impl Into<EntityId>, value: f64) -> Self {
        Self {
            entity: entity.into(),
            value: EntityValue::Number(value),
        }
    }

    pub fn binary(entity: impl Into<EntityId>, value: bool) -> Self {
        Self {
            entity: entity.into(),
            value: EntityValue::Binary(value),
        }
    }

    pub fn text(entity: impl Into<EntityId>, value: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            value: EntityValue::Text(value.into()),
        }
    }

    pub fn unavailable(entity: impl Into<EntityId>) -> Self {
        Self {
            entity: entity.into(),
            value: EntityValue::Unavailable,
        }
    }

    /// Returns the numeric value if this event concerns `entity`.
    pub fn number_for(&self, entity: &EntityId) -> Option<f64> {
        (self.entity == *entity).then(|| self.value.as_number()).flatten()
    }

    /// Returns the binary value if this event concerns `entity`.
    pub fn bool_for(&self, entity: &EntityId) -> Option<bool> {
        (self.entity == *entity).then(|| self.value.as_bool()).flatten()
    }

    /// Returns the text value if this event concerns `entity`.
    pub fn text_for(&self, entity: &EntityId) -> Option<&str> {
        if self.entity == *entity {
            self.value.as_text()
        } else {
            None
        }
    }
}

/// An actuation request for the host to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TurnOn(EntityId),
    TurnOff(EntityId),
    SetNumber { entity: EntityId, value: f64 },
}

impl Command {
    pub fn entity(&self) -> &EntityId {
        match self {
            Self::TurnOn(entity) | Self::TurnOff(entity) => entity,
            Self::SetNumber { entity, .. } => entity,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TurnOn(entity) => write!(f, "turn_on({entity})"),
            Self::TurnOff(entity) => write!(f, "turn_off({entity})"),
            Self::SetNumber { entity, value } => write!(f, "set({entity}={value})"),
        }
    }
}

/// Per-consumer inbound event queue.
///
/// Closing the inbox is the disposal step: later pushes are discarded.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: VecDeque<EntityEvent>,
    closed: bool,
}

impl Inbox {
    pub fn push(&mut self, event: EntityEvent) {
        if !self.closed {
            self.queue.push_back(event);
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = EntityEvent> + '_ {
        self.queue.drain(..)
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.queue.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
