//! A simulated house: uncontrolled load, solar, switchable devices, a car and
//! home batteries, exposed only through entity events and commands.

use chrono::{NaiveDateTime, TimeDelta, Timelike};

use super::profile::{BaseLoadProfile, SolarProfile};
use crate::config::{ConsumerConfig, InstallationConfig, SimulationConfig};
use crate::entity::{Command, EntityEvent, EntityId};

/// Reported appliance state before the program is loaded.
pub const APPLIANCE_IDLE: &str = "idle";
/// Reported appliance state once the program completed.
pub const APPLIANCE_DONE: &str = "done";

const FRIDGE_COOLING_PER_MIN: f64 = 0.2;
const FRIDGE_WARMING_PER_MIN: f64 = 0.05;
const BATTERY_RESERVE_PCT: f64 = 5.0;

fn hour_of(at: NaiveDateTime) -> f64 {
    f64::from(at.num_seconds_from_midnight()) / 3600.0
}

fn entity(id: &Option<String>) -> Option<EntityId> {
    id.as_deref().map(EntityId::from)
}

#[derive(Debug, Clone)]
struct Appliance {
    state_entity: EntityId,
    start_state: String,
    phases: Vec<(String, f64)>,
    ready_hour: f64,
    phase_len: TimeDelta,
    reported: String,
    phase: Option<(usize, TimeDelta)>,
}

impl Appliance {
    fn draw_w(&self, on: bool) -> f64 {
        match self.phase {
            Some((index, _)) if on => self.phases.get(index).map_or(0.0, |(_, w)| *w),
            _ => 0.0,
        }
    }

    /// Moves the program forward by `dt`. Returns the new reported state if it changed.
    fn advance(&mut self, at: NaiveDateTime, dt: TimeDelta, on: bool) -> Option<String> {
        let phase = self.phase;
        let next = match phase {
            None if self.reported == APPLIANCE_IDLE && hour_of(at) >= self.ready_hour => {
                self.start_state.clone()
            }
            None if self.reported == self.start_state && on && !self.phases.is_empty() => {
                self.phase = Some((0, TimeDelta::zero()));
                self.phases[0].0.clone()
            }
            Some((index, elapsed)) if on => {
                let elapsed = elapsed + dt;
                if elapsed < self.phase_len {
                    self.phase = Some((index, elapsed));
                    return None;
                }
                if index + 1 < self.phases.len() {
                    self.phase = Some((index + 1, TimeDelta::zero()));
                    self.phases[index + 1].0.clone()
                } else {
                    self.phase = None;
                    APPLIANCE_DONE.to_string()
                }
            }
            _ => return None,
        };
        self.reported = next.clone();
        Some(next)
    }
}

#[derive(Debug, Clone)]
struct Car {
    current_entity: EntityId,
    connected_entity: EntityId,
    at_home_entity: Option<EntityId>,
    level_entity: Option<EntityId>,
    target_entity: Option<EntityId>,
    voltage: f64,
    arrival_hour: f64,
    battery_kwh: f64,
    current: f64,
    connected: bool,
    level: f64,
}

impl Car {
    fn draw_w(&self) -> f64 {
        if self.connected && self.level < 100.0 {
            self.current.max(0.0) * self.voltage
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
enum Device {
    Socket,
    Cooling {
        temperature_entity: EntityId,
        temperature: f64,
    },
    Appliance(Appliance),
    Car(Car),
}

#[derive(Debug, Clone)]
struct SimLoad {
    name: String,
    switch: Option<EntityId>,
    power_entity: Option<EntityId>,
    peak_w: f64,
    on: bool,
    device: Device,
}

impl SimLoad {
    fn from_config(consumer: &ConsumerConfig, sim: &SimulationConfig) -> Option<Self> {
        let (switch, device) = if let Some(s) = &consumer.simple {
            (Some(s.switch_entity.as_str().into()), Device::Socket)
        } else if let Some(c) = &consumer.cooling {
            (
                Some(c.switch_entity.as_str().into()),
                Device::Cooling {
                    temperature_entity: c.temperature_entity.as_str().into(),
                    temperature: c.target_temperature + 1.0,
                },
            )
        } else if let Some(t) = &consumer.triggered {
            (
                Some(t.switch_entity.as_str().into()),
                Device::Appliance(Appliance {
                    state_entity: t.state_entity.as_str().into(),
                    start_state: t.start_state.clone(),
                    phases: t.phases.iter().map(|p| (p.state.clone(), p.peak_load)).collect(),
                    ready_hour: sim.appliance_ready_hour,
                    phase_len: TimeDelta::minutes(
                        i64::try_from(sim.appliance_phase_minutes).unwrap_or(i64::MAX / 60_000),
                    ),
                    reported: APPLIANCE_IDLE.to_string(),
                    phase: None,
                }),
            )
        } else {
            let c = consumer.car_charger.as_ref()?;
            (
                None,
                Device::Car(Car {
                    current_entity: c.current_entity.as_str().into(),
                    connected_entity: c.cable_connected_entity.as_str().into(),
                    at_home_entity: entity(&c.at_home_entity),
                    level_entity: entity(&c.battery_level_entity),
                    target_entity: entity(&c.target_level_entity),
                    voltage: c.voltage,
                    arrival_hour: sim.car.arrival_hour,
                    battery_kwh: sim.car.battery_kwh,
                    current: c.off_current,
                    connected: false,
                    level: sim.car.initial_level,
                }),
            )
        };

        Some(Self {
            name: consumer.name.clone(),
            switch,
            power_entity: entity(&consumer.power_entity),
            peak_w: consumer.peak_load,
            on: false,
            device,
        })
    }

    fn draw_w(&self) -> f64 {
        match &self.device {
            Device::Socket | Device::Cooling { .. } if self.on => self.peak_w,
            Device::Socket | Device::Cooling { .. } => 0.0,
            Device::Appliance(appliance) => appliance.draw_w(self.on),
            Device::Car(car) => car.draw_w(),
        }
    }

    fn initial_events(&self) -> Vec<EntityEvent> {
        let mut events = Vec::new();
        if let Some(switch) = &self.switch {
            events.push(EntityEvent::binary(switch.clone(), self.on));
        }
        match &self.device {
            Device::Socket => {}
            Device::Cooling {
                temperature_entity,
                temperature,
            } => events.push(EntityEvent::number(temperature_entity.clone(), *temperature)),
            Device::Appliance(appliance) => events.push(EntityEvent::text(
                appliance.state_entity.clone(),
                appliance.reported.clone(),
            )),
            Device::Car(car) => {
                events.push(EntityEvent::number(car.current_entity.clone(), car.current));
                events.push(EntityEvent::binary(car.connected_entity.clone(), car.connected));
                if let Some(at_home) = &car.at_home_entity {
                    events.push(EntityEvent::binary(at_home.clone(), true));
                }
                if let Some(target) = &car.target_entity {
                    events.push(EntityEvent::number(target.clone(), 100.0));
                }
                if let Some(level) = &car.level_entity {
                    events.push(EntityEvent::number(level.clone(), car.level));
                }
            }
        }
        events
    }

    /// Integrates the device over `dt` ending at `at` and reports what changed.
    fn advance(&mut self, at: NaiveDateTime, dt: TimeDelta, events: &mut Vec<EntityEvent>) {
        let minutes = dt.num_milliseconds() as f64 / 60_000.0;
        let on = self.on;
        let draw_w = self.draw_w();
        match &mut self.device {
            Device::Socket => {}
            Device::Cooling {
                temperature_entity,
                temperature,
            } => {
                let rate = if on {
                    -FRIDGE_COOLING_PER_MIN
                } else {
                    FRIDGE_WARMING_PER_MIN
                };
                *temperature += rate * minutes;
                events.push(EntityEvent::number(temperature_entity.clone(), *temperature));
            }
            Device::Appliance(appliance) => {
                if let Some(state) = appliance.advance(at, dt, on) {
                    tracing::debug!(appliance = %self.name, %state, "appliance state changed");
                    events.push(EntityEvent::text(appliance.state_entity.clone(), state));
                }
            }
            Device::Car(car) => {
                if !car.connected && hour_of(at) >= car.arrival_hour {
                    car.connected = true;
                    tracing::debug!(car = %self.name, "car connected");
                    events.push(EntityEvent::binary(car.connected_entity.clone(), true));
                }
                let added_kwh = draw_w * minutes / 60.0 / 1000.0;
                car.level = (car.level + 100.0 * added_kwh / car.battery_kwh).min(100.0);
                if let Some(level) = &car.level_entity {
                    events.push(EntityEvent::number(level.clone(), car.level));
                }
            }
        }
        if let Some(power) = &self.power_entity {
            events.push(EntityEvent::number(power.clone(), self.draw_w()));
        }
    }

    /// Applies a command addressed to this load and returns the echoed state.
    fn apply(&mut self, command: &Command) -> Option<EntityEvent> {
        match command {
            Command::TurnOn(e) | Command::TurnOff(e) if self.switch.as_ref() == Some(e) => {
                self.on = matches!(command, Command::TurnOn(_));
                Some(EntityEvent::binary(e.clone(), self.on))
            }
            Command::SetNumber { entity, value } => match &mut self.device {
                Device::Car(car) if car.current_entity == *entity => {
                    car.current = value.max(0.0);
                    Some(EntityEvent::number(entity.clone(), car.current))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SimBattery {
    capacity_kwh: f64,
    soc: f64,
    charge_limit_w: f64,
    discharge_limit_w: f64,
    max_charge_power: EntityId,
    max_discharge_power: EntityId,
    power_entity: Option<EntityId>,
    soc_entity: Option<EntityId>,
    /// Positive while charging (W).
    power_w: f64,
}

impl SimBattery {
    /// Picks the battery power that offsets `net_w` within limits. Positive
    /// result means charging.
    fn dispatch(&mut self, net_w: f64) -> f64 {
        self.power_w = if net_w > 0.0 && self.soc > BATTERY_RESERVE_PCT {
            -net_w.min(self.discharge_limit_w)
        } else if net_w < 0.0 && self.soc < 100.0 {
            (-net_w).min(self.charge_limit_w)
        } else {
            0.0
        };
        self.power_w
    }

    fn integrate(&mut self, dt: TimeDelta) {
        let hours = dt.num_milliseconds() as f64 / 3_600_000.0;
        let delta_pct = 100.0 * self.power_w * hours / 1000.0 / self.capacity_kwh;
        self.soc = (self.soc + delta_pct).clamp(0.0, 100.0);
    }
}

/// One step of the house as seen from the meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomeSample {
    /// Uncontrolled household demand (W).
    pub base_w: f64,
    /// Solar production (W, positive).
    pub solar_w: f64,
    /// Sum of all controllable devices (W).
    pub controlled_w: f64,
    /// Total battery power, positive while charging (W).
    pub battery_w: f64,
    pub import_w: f64,
    pub export_w: f64,
}

impl HomeSample {
    pub fn net_w(&self) -> f64 {
        self.import_w - self.export_w
    }
}

/// Simulated household the orchestrator controls through entities only.
#[derive(Debug, Clone)]
pub struct SimulatedHome {
    import: EntityId,
    export: EntityId,
    peak_import: EntityId,
    voltage: Option<EntityId>,
    gates: Vec<EntityId>,
    peak_import_kw: f64,
    grid_voltage: f64,
    base: BaseLoadProfile,
    solar: SolarProfile,
    loads: Vec<SimLoad>,
    batteries: Vec<SimBattery>,
}

impl SimulatedHome {
    /// Builds the house described by a validated installation config.
    pub fn from_config(config: &InstallationConfig) -> Self {
        let sim = &config.simulation;
        let seed = sim.seed;
        let gates = config
            .consumers
            .iter()
            .flat_map(|c| c.time_windows.iter())
            .filter_map(|w| entity(&w.gate_entity))
            .collect();

        Self {
            import: config.grid.import_entity.as_str().into(),
            export: config.grid.export_entity.as_str().into(),
            peak_import: config.grid.peak_import_entity.as_str().into(),
            voltage: entity(&config.grid.voltage_entity),
            gates,
            peak_import_kw: sim.peak_import_kw,
            grid_voltage: sim.voltage,
            base: BaseLoadProfile::new(
                sim.base_load.base_w,
                sim.base_load.amp_w,
                sim.base_load.phase_rad,
                sim.base_load.noise_std_w,
                seed,
            ),
            solar: SolarProfile::new(
                sim.solar.peak_w,
                sim.solar.sunrise_hour,
                sim.solar.sunset_hour,
                sim.solar.noise_std,
                seed.wrapping_add(1),
            ),
            loads: config
                .consumers
                .iter()
                .filter_map(|c| SimLoad::from_config(c, sim))
                .collect(),
            batteries: config
                .batteries
                .iter()
                .map(|b| SimBattery {
                    capacity_kwh: b.capacity_kwh,
                    soc: 50.0,
                    charge_limit_w: b.max_charge_power_w,
                    discharge_limit_w: b.max_discharge_power_w,
                    max_charge_power: b.max_charge_power_entity.as_str().into(),
                    max_discharge_power: b.max_discharge_power_entity.as_str().into(),
                    power_entity: entity(&b.power_entity),
                    soc_entity: entity(&b.state_of_charge_entity),
                    power_w: 0.0,
                })
                .collect(),
        }
    }

    /// Device and set-point states as they are before the first step.
    pub fn initial_events(&self) -> Vec<EntityEvent> {
        let mut events = vec![EntityEvent::number(self.peak_import.clone(), self.peak_import_kw)];
        if let Some(voltage) = &self.voltage {
            events.push(EntityEvent::number(voltage.clone(), self.grid_voltage));
        }
        events.extend(self.gates.iter().map(|g| EntityEvent::binary(g.clone(), true)));
        for load in &self.loads {
            events.extend(load.initial_events());
        }
        for battery in &self.batteries {
            events.push(EntityEvent::number(
                battery.max_charge_power.clone(),
                battery.charge_limit_w,
            ));
            events.push(EntityEvent::number(
                battery.max_discharge_power.clone(),
                battery.discharge_limit_w,
            ));
            if let Some(soc) = &battery.soc_entity {
                events.push(EntityEvent::number(soc.clone(), battery.soc));
            }
        }
        events
    }

    /// Carries out a command and returns the state change it caused.
    /// Commands for entities the house does not have are ignored.
    pub fn apply(&mut self, command: &Command) -> Vec<EntityEvent> {
        for load in &mut self.loads {
            if let Some(echo) = load.apply(command) {
                tracing::debug!(device = %load.name, %command, "command applied");
                return vec![echo];
            }
        }
        if let Command::SetNumber { entity, value } = command {
            for battery in &mut self.batteries {
                if battery.max_charge_power == *entity {
                    battery.charge_limit_w = value.max(0.0);
                    return vec![EntityEvent::number(entity.clone(), battery.charge_limit_w)];
                }
                if battery.max_discharge_power == *entity {
                    battery.discharge_limit_w = value.max(0.0);
                    return vec![EntityEvent::number(entity.clone(), battery.discharge_limit_w)];
                }
            }
        }
        tracing::warn!(%command, "command for unknown entity ignored");
        Vec::new()
    }

    /// Advances every device by `dt` ending at `at`, then measures the grid.
    pub fn step(&mut self, at: NaiveDateTime, dt: TimeDelta) -> (HomeSample, Vec<EntityEvent>) {
        let mut events = Vec::new();
        for battery in &mut self.batteries {
            battery.integrate(dt);
        }
        for load in &mut self.loads {
            load.advance(at, dt, &mut events);
        }

        let base_w = self.base.demand_w(at);
        let solar_w = self.solar.production_w(at);
        let controlled_w: f64 = self.loads.iter().map(SimLoad::draw_w).sum();

        let mut net_w = base_w + controlled_w - solar_w;
        let mut battery_w = 0.0;
        for battery in &mut self.batteries {
            let power = battery.dispatch(net_w);
            net_w += power;
            battery_w += power;
            if let Some(entity) = &battery.power_entity {
                events.push(EntityEvent::number(entity.clone(), power));
            }
            if let Some(entity) = &battery.soc_entity {
                events.push(EntityEvent::number(entity.clone(), battery.soc));
            }
        }

        let sample = HomeSample {
            base_w,
            solar_w,
            controlled_w,
            battery_w,
            import_w: net_w.max(0.0),
            export_w: (-net_w).max(0.0),
        };
        events.push(EntityEvent::number(self.import.clone(), sample.import_w));
        events.push(EntityEvent::number(self.export.clone(), sample.export_w));
        (sample, events)
    }

    /// Contracted peak import (W).
    pub fn peak_import_w(&self) -> f64 {
        self.peak_import_kw * 1000.0
    }

    /// Car battery level (%) of the first simulated car, if any.
    pub fn car_level(&self) -> Option<f64> {
        self.loads.iter().find_map(|l| match &l.device {
            Device::Car(car) => Some(car.level),
            _ => None,
        })
    }

    /// Draw of the named device (W).
    pub fn device_draw_w(&self, name: &str) -> Option<f64> {
        self.loads.iter().find(|l| l.name == name).map(SimLoad::draw_w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .expect("valid timestamp")
    }

    fn quiet_config() -> InstallationConfig {
        let mut config = InstallationConfig::solar_day();
        config.simulation.base_load.noise_std_w = 0.0;
        config.simulation.solar.noise_std = 0.0;
        config.batteries.clear();
        config
    }

    #[test]
    fn switch_commands_are_echoed() {
        let mut home = SimulatedHome::from_config(&quiet_config());
        let events = home.apply(&Command::TurnOn("switch.dishwasher".into()));
        assert_eq!(events, vec![EntityEvent::binary("switch.dishwasher", true)]);
        assert_eq!(home.device_draw_w("dishwasher"), Some(1800.0));
    }

    #[test]
    fn unknown_command_is_ignored() {
        let mut home = SimulatedHome::from_config(&quiet_config());
        assert!(home.apply(&Command::TurnOn("switch.garage".into())).is_empty());
    }

    #[test]
    fn import_and_export_follow_the_balance() {
        let mut home = SimulatedHome::from_config(&quiet_config());
        let (night, _) = home.step(at(2, 0), TimeDelta::minutes(1));
        assert!(night.import_w > 0.0);
        assert_eq!(night.export_w, 0.0);
        assert_eq!(night.solar_w, 0.0);

        let (noon, events) = home.step(at(13, 30), TimeDelta::minutes(1));
        assert!(noon.export_w > 0.0);
        assert!(events.contains(&EntityEvent::number("sensor.grid_import", 0.0)));
    }

    #[test]
    fn car_connects_and_charges_at_set_current() {
        let mut home = SimulatedHome::from_config(&quiet_config());
        let (_, events) = home.step(at(9, 0), TimeDelta::minutes(1));
        assert!(events.contains(&EntityEvent::binary("binary_sensor.car_connected", true)));

        home.apply(&Command::SetNumber {
            entity: "number.charger_current".into(),
            value: 10.0,
        });
        assert_eq!(home.device_draw_w("car"), Some(2300.0));
        let before = home.car_level().unwrap_or_default();
        home.step(at(10, 0), TimeDelta::hours(1));
        assert!(home.car_level().unwrap_or_default() > before);
    }

    #[test]
    fn appliance_runs_its_program_while_powered() {
        let mut home = SimulatedHome::from_config(&quiet_config());
        let (_, events) = home.step(at(9, 0), TimeDelta::minutes(1));
        assert!(events.contains(&EntityEvent::text("sensor.washer_program", "ready")));

        home.apply(&Command::TurnOn("switch.washer".into()));
        let (_, events) = home.step(at(9, 1), TimeDelta::minutes(1));
        assert!(events.contains(&EntityEvent::text("sensor.washer_program", "prewash")));
        assert_eq!(home.device_draw_w("washer"), Some(300.0));

        let (_, events) = home.step(at(9, 21), TimeDelta::minutes(20));
        assert!(events.contains(&EntityEvent::text("sensor.washer_program", "heating")));
    }

    #[test]
    fn fridge_warms_while_off() {
        let mut home = SimulatedHome::from_config(&quiet_config());
        let (_, events) = home.step(at(1, 0), TimeDelta::minutes(20));
        let temperature = events
            .iter()
            .find_map(|e| e.number_for(&"sensor.fridge_temperature".into()));
        assert!(temperature.is_some_and(|t| (t - 8.0).abs() < 1e-9));
    }
}
