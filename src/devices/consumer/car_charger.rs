use chrono::NaiveDateTime;

use super::{BalancingMethod, Behavior, ConsumerBase, ConsumerState, DynamicLoad, Rebalanced};
use crate::entity::{Command, EntityEvent, EntityId};

/// Entities a car charger reads and writes.
#[derive(Debug, Clone)]
pub struct CarChargerEntities {
    /// Writable charge current set-point (A).
    pub current: EntityId,
    pub cable_connected: EntityId,
    /// Vehicle presence; the car is assumed home when not configured.
    pub at_home: Option<EntityId>,
    /// Vehicle battery level (%).
    pub battery_level: Option<EntityId>,
    /// Maximum battery level to charge to (%); 100 when not configured.
    pub target_level: Option<EntityId>,
}

/// Wallbox with a continuously adjustable charge current.
#[derive(Debug, Clone)]
pub struct CarChargerConsumer {
    entities: CarChargerEntities,
    /// Lowest current the charger accepts while charging (A).
    pub min_current: f64,
    /// Highest current the installation allows (A).
    pub max_current: f64,
    /// Set-point meaning "not charging" (A).
    pub off_current: f64,
    /// Nominal voltage used for watt/amp conversions (V).
    pub voltage: f64,
    balancing_method: BalancingMethod,
    balance_on_behalf_of: Option<String>,
    allow_battery_power: bool,
    current: f64,
    cable_connected: bool,
    at_home: Option<bool>,
    battery_level: Option<f64>,
    target_level: Option<f64>,
}

impl CarChargerConsumer {
    /// # Arguments
    ///
    /// * `min_current` - Lowest charging current in A (must be > `off_current`)
    /// * `max_current` - Highest charging current in A (must be >= `min_current`)
    /// * `off_current` - Set-point written to stop charging, in A
    /// * `voltage` - Nominal voltage in V (must be > 0)
    ///
    /// # Panics
    ///
    /// Panics on an inconsistent current range or a non-positive voltage.
    pub fn new(
        entities: CarChargerEntities,
        min_current: f64,
        max_current: f64,
        off_current: f64,
        voltage: f64,
    ) -> Self {
        assert!(voltage > 0.0);
        assert!(min_current > off_current);
        assert!(max_current >= min_current);

        Self {
            entities,
            min_current,
            max_current,
            off_current,
            voltage,
            balancing_method: BalancingMethod::SolarOnly,
            balance_on_behalf_of: None,
            allow_battery_power: false,
            current: off_current,
            cable_connected: false,
            at_home: None,
            battery_level: None,
            target_level: None,
        }
    }

    pub fn with_balancing(mut self, method: BalancingMethod, on_behalf_of: Option<String>) -> Self {
        self.balancing_method = method;
        self.balance_on_behalf_of = on_behalf_of;
        self
    }

    pub fn with_battery_power(mut self, allow: bool) -> Self {
        self.allow_battery_power = allow;
        self
    }

    fn is_home(&self) -> bool {
        self.entities.at_home.is_none() || self.at_home.unwrap_or(false)
    }

    fn is_full(&self) -> bool {
        let target = self.target_level.unwrap_or(100.0);
        self.battery_level.is_some_and(|level| level >= target)
    }

    /// Connected at home and not yet charged to the target level.
    pub fn wants_power(&self) -> bool {
        self.cable_connected && self.is_home() && !self.is_full()
    }

    fn write_current(&self, current: f64) -> Command {
        Command::SetNumber {
            entity: self.entities.current.clone(),
            value: current,
        }
    }
}

impl Behavior for CarChargerConsumer {
    fn watches(&self, entity: &EntityId) -> bool {
        let e = &self.entities;
        *entity == e.current
            || *entity == e.cable_connected
            || e.at_home.as_ref() == Some(entity)
            || e.battery_level.as_ref() == Some(entity)
            || e.target_level.as_ref() == Some(entity)
    }

    fn observe(&mut self, event: &EntityEvent) {
        let e = &self.entities;
        if let Some(current) = event.number_for(&e.current) {
            self.current = current;
        } else if let Some(connected) = event.bool_for(&e.cable_connected) {
            self.cable_connected = connected;
        } else if e.at_home.as_ref() == Some(&event.entity) {
            self.at_home = event.value.as_bool();
        } else if e.battery_level.as_ref() == Some(&event.entity) {
            self.battery_level = event.value.as_number();
        } else if e.target_level.as_ref() == Some(&event.entity) {
            self.target_level = event.value.as_number();
        }
    }

    fn is_running(&self) -> bool {
        self.current > self.off_current
    }

    fn desired_state(&self, base: &ConsumerBase, now: NaiveDateTime) -> ConsumerState {
        let running = self.is_running();
        let wants = self.wants_power();

        if running {
            if !wants {
                return ConsumerState::Off;
            }
            return match base.generic_desired_state(true, true, now) {
                ConsumerState::Running if self.balancing_method == BalancingMethod::SolarOnly => {
                    ConsumerState::RunOnSolarExcess
                }
                state => state,
            };
        }
        base.generic_desired_state(false, wants, now)
    }

    fn peak_load(&self, _base: &ConsumerBase) -> f64 {
        if self.wants_power() || self.is_running() {
            self.min_current * self.voltage
        } else {
            0.0
        }
    }

    fn current_load(&self, base: &ConsumerBase) -> f64 {
        base.power_w().unwrap_or_else(|| {
            if self.is_running() {
                self.current * self.voltage
            } else {
                0.0
            }
        })
    }

    // the set-point is only trusted once the charger echoes it back
    fn turn_on(&mut self) -> Vec<Command> {
        vec![self.write_current(self.min_current)]
    }

    fn turn_off(&mut self) -> Vec<Command> {
        vec![self.write_current(self.off_current)]
    }
}

impl DynamicLoad for CarChargerConsumer {
    fn min_current(&self) -> f64 {
        self.min_current
    }

    fn max_current(&self) -> f64 {
        self.max_current
    }

    fn current(&self) -> f64 {
        self.current
    }

    fn voltage(&self) -> f64 {
        self.voltage
    }

    fn releasable_power(&self) -> f64 {
        if !self.is_running() {
            return 0.0;
        }
        ((self.current - self.min_current) * self.voltage).max(0.0)
    }

    fn balancing_method(&self) -> BalancingMethod {
        self.balancing_method
    }

    fn set_balancing_method(&mut self, method: BalancingMethod) {
        self.balancing_method = method;
    }

    fn balance_on_behalf_of(&self) -> Option<&str> {
        self.balance_on_behalf_of.as_deref()
    }

    fn allows_battery_power(&self) -> bool {
        self.allow_battery_power
    }

    /// Rounds the equivalent current delta to the nearest amp and clamps the
    /// resulting set-point to `[min_current, max_current]`.
    fn rebalance(&mut self, net_grid_usage: f64) -> Rebalanced {
        let delta = (-net_grid_usage / self.voltage).round();
        let target = (self.current + delta).clamp(self.min_current, self.max_current);
        let applied = target - self.current;

        if applied == 0.0 {
            return Rebalanced {
                realized_w: 0.0,
                command: None,
            };
        }

        tracing::debug!(from = self.current, to = target, "rebalancing charge current");
        self.current = target;
        let command = self.write_current(target);
        Rebalanced {
            realized_w: applied * self.voltage,
            command: Some(command),
        }
    }
}
