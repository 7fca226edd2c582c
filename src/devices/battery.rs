use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::entity::{Command, EntityEvent, EntityId};

/// Entities a battery reads and writes.
#[derive(Debug, Clone)]
pub struct BatteryEntities {
    /// Battery power (W). Positive = charging, negative = discharging.
    pub power: Option<EntityId>,
    /// State of charge (%).
    pub state_of_charge: Option<EntityId>,
    /// Cumulative energy throughput (kWh).
    pub energy: Option<EntityId>,
    /// Writable maximum charge power set-point (W).
    pub max_charge_power: EntityId,
    /// Writable maximum discharge power set-point (W).
    pub max_discharge_power: EntityId,
}

/// A home battery whose charging and discharging are toggled through
/// externally writable max-power set-points.
///
/// `can_charge`/`can_discharge` are derived from the set-points, never stored.
#[derive(Debug, Clone)]
pub struct Battery {
    name: String,
    /// Usable capacity in kWh.
    pub capacity_kwh: f64,
    /// Set-point written when charging is enabled (W).
    pub max_charge_power_w: f64,
    /// Set-point written when discharging is enabled (W).
    pub max_discharge_power_w: f64,
    entities: BatteryEntities,
    charge_set_point: f64,
    discharge_set_point: f64,
    power_w: Option<f64>,
    state_of_charge: Option<f64>,
    energy_kwh: Option<f64>,
    last_change: Option<NaiveDateTime>,
}

/// Persisted part of a battery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub last_change: Option<NaiveDateTime>,
}

impl Battery {
    /// Creates a battery with both set-points unknown (treated as disabled).
    ///
    /// # Panics
    ///
    /// Panics if `capacity_kwh` is not positive or a max power is negative.
    pub fn new(
        name: impl Into<String>,
        capacity_kwh: f64,
        max_charge_power_w: f64,
        max_discharge_power_w: f64,
        entities: BatteryEntities,
    ) -> Self {
        assert!(capacity_kwh > 0.0);
        assert!(max_charge_power_w >= 0.0 && max_discharge_power_w >= 0.0);

        Self {
            name: name.into(),
            capacity_kwh,
            max_charge_power_w,
            max_discharge_power_w,
            entities,
            charge_set_point: 0.0,
            discharge_set_point: 0.0,
            power_w: None,
            state_of_charge: None,
            energy_kwh: None,
            last_change: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watches(&self, entity: &EntityId) -> bool {
        let e = &self.entities;
        *entity == e.max_charge_power
            || *entity == e.max_discharge_power
            || e.power.as_ref() == Some(entity)
            || e.state_of_charge.as_ref() == Some(entity)
            || e.energy.as_ref() == Some(entity)
    }

    /// Applies a sensor or set-point change. Unusable values are ignored.
    pub fn observe(&mut self, event: &EntityEvent) {
        let Some(value) = event.value.as_number() else {
            return;
        };
        let e = &self.entities;
        if event.entity == e.max_charge_power {
            self.charge_set_point = value;
        } else if event.entity == e.max_discharge_power {
            self.discharge_set_point = value;
        } else if e.power.as_ref() == Some(&event.entity) {
            self.power_w = Some(value);
        } else if e.state_of_charge.as_ref() == Some(&event.entity) {
            self.state_of_charge = Some(value);
        } else if e.energy.as_ref() == Some(&event.entity) {
            self.energy_kwh = Some(value);
        }
    }

    pub fn can_charge(&self) -> bool {
        self.charge_set_point > 0.0
    }

    pub fn can_discharge(&self) -> bool {
        self.discharge_set_point > 0.0
    }

    /// Writes the configured maximum. A battery configured with no charge
    /// power has nothing to enable.
    pub fn enable_charging(&mut self, now: NaiveDateTime) -> Option<Command> {
        if self.can_charge() || self.max_charge_power_w <= 0.0 {
            return None;
        }
        self.charge_set_point = self.max_charge_power_w;
        Some(self.write(self.entities.max_charge_power.clone(), self.max_charge_power_w, now))
    }

    pub fn disable_charging(&mut self, now: NaiveDateTime) -> Option<Command> {
        if !self.can_charge() {
            return None;
        }
        self.charge_set_point = 0.0;
        Some(self.write(self.entities.max_charge_power.clone(), 0.0, now))
    }

    pub fn enable_discharging(&mut self, now: NaiveDateTime) -> Option<Command> {
        if self.can_discharge() || self.max_discharge_power_w <= 0.0 {
            return None;
        }
        self.discharge_set_point = self.max_discharge_power_w;
        Some(self.write(
            self.entities.max_discharge_power.clone(),
            self.max_discharge_power_w,
            now,
        ))
    }

    pub fn disable_discharging(&mut self, now: NaiveDateTime) -> Option<Command> {
        if !self.can_discharge() {
            return None;
        }
        self.discharge_set_point = 0.0;
        Some(self.write(self.entities.max_discharge_power.clone(), 0.0, now))
    }

    fn write(&mut self, entity: EntityId, value: f64, now: NaiveDateTime) -> Command {
        self.last_change = Some(now);
        tracing::info!(battery = %self.name, %entity, value, "battery set-point changed");
        Command::SetNumber { entity, value }
    }

    pub fn last_change(&self) -> Option<NaiveDateTime> {
        self.last_change
    }

    pub fn power_w(&self) -> Option<f64> {
        self.power_w
    }

    pub fn state_of_charge(&self) -> Option<f64> {
        self.state_of_charge
    }

    pub fn energy_kwh(&self) -> Option<f64> {
        self.energy_kwh
    }

    pub fn snapshot(&self) -> BatterySnapshot {
        BatterySnapshot {
            last_change: self.last_change,
        }
    }

    pub fn restore(&mut self, snapshot: BatterySnapshot) {
        self.last_change = snapshot.last_change;
    }
}
