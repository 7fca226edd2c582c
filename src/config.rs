//! TOML-based installation configuration and preset definitions.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::Deserialize;

use crate::devices::consumer::{
    BalancingMethod, CarChargerConsumer, CarChargerEntities, CoolingConsumer, SimpleConsumer,
    TriggeredConsumer,
};
use crate::devices::{Battery, BatteryEntities, Consumer, ConsumerKind, ConsumerSettings};
use crate::engine::{EngineSettings, GridEntities};
use crate::entity::EntityId;
use crate::time_window::TimeWindow;

/// Top-level installation configuration parsed from TOML.
///
/// Load from TOML with [`InstallationConfig::from_toml_file`] or use one of
/// the built-in presets via [`InstallationConfig::from_preset`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallationConfig {
    /// Orchestrator timing.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Grid connection sensors.
    #[serde(default)]
    pub grid: GridConfig,
    /// Home batteries.
    #[serde(default)]
    pub batteries: Vec<BatteryConfig>,
    /// Controllable consumers, in admission order.
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
    /// Household simulation parameters.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Orchestrator timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Guard tick period (s, must be > 0).
    pub guard_interval_secs: u64,
    /// Admission pass debounce (ms, 0 = synchronous).
    pub manage_debounce_ms: u64,
    /// State report debounce (ms, 0 = synchronous).
    pub report_debounce_ms: u64,
    /// Settling time and rolling-average window (s).
    pub min_change_interval_secs: u64,
    /// Samples kept per grid direction (must be > 0).
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = EngineSettings::default();
        Self {
            guard_interval_secs: defaults.guard_interval.num_seconds().unsigned_abs(),
            manage_debounce_ms: defaults.manage_debounce.num_milliseconds().unsigned_abs(),
            report_debounce_ms: defaults.report_debounce.num_milliseconds().unsigned_abs(),
            min_change_interval_secs: defaults.min_change_interval.num_seconds().unsigned_abs(),
            history_capacity: defaults.history_capacity,
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            guard_interval: secs(self.guard_interval_secs),
            manage_debounce: millis(self.manage_debounce_ms),
            report_debounce: millis(self.report_debounce_ms),
            min_change_interval: secs(self.min_change_interval_secs),
            history_capacity: self.history_capacity,
        }
    }
}

fn secs(value: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

fn millis(value: u64) -> TimeDelta {
    TimeDelta::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Grid connection sensors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    /// Instantaneous import (W).
    pub import_entity: String,
    /// Instantaneous export (W).
    pub export_entity: String,
    /// Contracted or measured peak import (kW).
    pub peak_import_entity: String,
    pub voltage_entity: Option<String>,
    pub average_demand_entity: Option<String>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            import_entity: "sensor.grid_import".to_string(),
            export_entity: "sensor.grid_export".to_string(),
            peak_import_entity: "sensor.grid_peak_import".to_string(),
            voltage_entity: Some("sensor.grid_voltage".to_string()),
            average_demand_entity: None,
        }
    }
}

impl GridConfig {
    pub fn entities(&self) -> GridEntities {
        GridEntities {
            import: self.import_entity.as_str().into(),
            export: self.export_entity.as_str().into(),
            peak_import: self.peak_import_entity.as_str().into(),
            voltage: entity(&self.voltage_entity),
            average_demand: entity(&self.average_demand_entity),
        }
    }
}

fn entity(id: &Option<String>) -> Option<EntityId> {
    id.as_deref().map(EntityId::from)
}

/// Home battery parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatteryConfig {
    pub name: String,
    /// Usable capacity (kWh, must be > 0).
    pub capacity_kwh: f64,
    /// Charge set-point written when charging is enabled (W).
    pub max_charge_power_w: f64,
    /// Discharge set-point written when discharging is enabled (W).
    pub max_discharge_power_w: f64,
    pub power_entity: Option<String>,
    pub state_of_charge_entity: Option<String>,
    pub energy_entity: Option<String>,
    pub max_charge_power_entity: String,
    pub max_discharge_power_entity: String,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            name: "battery".to_string(),
            capacity_kwh: 10.0,
            max_charge_power_w: 5000.0,
            max_discharge_power_w: 5000.0,
            power_entity: Some("sensor.battery_power".to_string()),
            state_of_charge_entity: Some("sensor.battery_soc".to_string()),
            energy_entity: None,
            max_charge_power_entity: "number.battery_max_charge_power".to_string(),
            max_discharge_power_entity: "number.battery_max_discharge_power".to_string(),
        }
    }
}

impl BatteryConfig {
    /// Builds the battery. Call [`InstallationConfig::validate`] first.
    pub fn build(&self) -> Battery {
        Battery::new(
            self.name.clone(),
            self.capacity_kwh,
            self.max_charge_power_w,
            self.max_discharge_power_w,
            BatteryEntities {
                power: entity(&self.power_entity),
                state_of_charge: entity(&self.state_of_charge_entity),
                energy: entity(&self.energy_entity),
                max_charge_power: self.max_charge_power_entity.as_str().into(),
                max_discharge_power: self.max_discharge_power_entity.as_str().into(),
            },
        )
    }
}

/// A daily window such as `"22:00"`-`"02:00"`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeWindowConfig {
    /// `"HH:MM"` or `"HH:MM:SS"`.
    pub start: String,
    pub end: String,
    /// Weekday names (`"mon"`, `"Tuesday"`, ...); empty means every day.
    pub days: Vec<String>,
    /// Binary entity gating the window.
    pub gate_entity: Option<String>,
    /// Window is active while the gate is off.
    pub invert: bool,
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

impl TimeWindowConfig {
    fn build(&self, field: &str) -> Result<TimeWindow, ConfigError> {
        let start = parse_time(&self.start).ok_or_else(|| ConfigError {
            field: format!("{field}.start"),
            message: format!("invalid time \"{}\", expected HH:MM", self.start),
        })?;
        let end = parse_time(&self.end).ok_or_else(|| ConfigError {
            field: format!("{field}.end"),
            message: format!("invalid time \"{}\", expected HH:MM", self.end),
        })?;
        let days = self
            .days
            .iter()
            .map(|d| {
                d.parse::<Weekday>().map_err(|_| ConfigError {
                    field: format!("{field}.days"),
                    message: format!("unknown weekday \"{d}\""),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut window = TimeWindow::new(start, end).on_days(days);
        if let Some(gate) = &self.gate_entity {
            window = window.gated_by(gate.as_str().into(), self.invert);
        }
        Ok(window)
    }
}

/// On/off socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimpleConfig {
    pub switch_entity: String,
}

/// Hysteresis-controlled cooling device.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoolingConfig {
    pub switch_entity: String,
    pub temperature_entity: String,
    /// Cooling wanted at or above this temperature (°C).
    pub target_temperature: f64,
    /// Cooling critical at or above this temperature (°C).
    pub max_temperature: f64,
}

/// One `(reported state, peak load)` entry of a triggered appliance.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseConfig {
    pub state: String,
    pub peak_load: f64,
}

/// Appliance driven by its own reported program state.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggeredConfig {
    pub state_entity: String,
    pub switch_entity: String,
    /// Reported state meaning "ready, waiting for power".
    pub start_state: String,
    /// Reported state meaning "must start now".
    #[serde(default)]
    pub critical_state: Option<String>,
    /// Program phases in order.
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub can_force_shutdown: bool,
}

/// Wallbox with adjustable charge current.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CarChargerConfig {
    pub current_entity: String,
    pub cable_connected_entity: String,
    pub at_home_entity: Option<String>,
    pub battery_level_entity: Option<String>,
    pub target_level_entity: Option<String>,
    /// Lowest charging current (A).
    pub min_current: f64,
    /// Highest charging current (A).
    pub max_current: f64,
    /// Set-point meaning "not charging" (A).
    pub off_current: f64,
    /// Nominal voltage (V).
    pub voltage: f64,
    /// `solar_only`, `mid_peak`, `near_peak` or `max_peak`.
    pub balancing_method: String,
    /// Group this charger throttles for (`"all"` for everyone).
    pub balance_on_behalf_of: Option<String>,
    pub allow_battery_power: bool,
}

impl Default for CarChargerConfig {
    fn default() -> Self {
        Self {
            current_entity: "number.charger_current".to_string(),
            cable_connected_entity: "binary_sensor.car_connected".to_string(),
            at_home_entity: None,
            battery_level_entity: Some("sensor.car_battery_level".to_string()),
            target_level_entity: None,
            min_current: 6.0,
            max_current: 16.0,
            off_current: 0.0,
            voltage: 230.0,
            balancing_method: "solar_only".to_string(),
            balance_on_behalf_of: None,
            allow_battery_power: false,
        }
    }
}

/// One controllable consumer. Exactly one variant table must be present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Unique name.
    pub name: String,
    /// Measured draw (W).
    pub power_entity: Option<String>,
    /// Draw once running (W).
    pub peak_load: f64,
    /// Start only while net load is at or below this (W); unset = no threshold.
    pub switch_on_load: Option<f64>,
    /// Shed while net load is above this (W); unset = never shed for solar.
    pub switch_off_load: Option<f64>,
    pub min_runtime_secs: Option<u64>,
    pub max_runtime_secs: Option<u64>,
    pub min_timeout_secs: Option<u64>,
    pub max_timeout_secs: Option<u64>,
    pub critically_needed_entity: Option<String>,
    pub groups: Vec<String>,
    pub time_windows: Vec<TimeWindowConfig>,
    pub simple: Option<SimpleConfig>,
    pub cooling: Option<CoolingConfig>,
    pub triggered: Option<TriggeredConfig>,
    pub car_charger: Option<CarChargerConfig>,
}

impl ConsumerConfig {
    fn variant_count(&self) -> usize {
        [
            self.simple.is_some(),
            self.cooling.is_some(),
            self.triggered.is_some(),
            self.car_charger.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    fn settings(&self, field: &str) -> Result<ConsumerSettings, ConfigError> {
        let time_windows = self
            .time_windows
            .iter()
            .enumerate()
            .map(|(i, w)| w.build(&format!("{field}.time_windows[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ConsumerSettings {
            power_entity: entity(&self.power_entity),
            peak_load: self.peak_load,
            switch_on_load: self.switch_on_load.unwrap_or(f64::INFINITY),
            switch_off_load: self.switch_off_load.unwrap_or(f64::INFINITY),
            min_runtime: self.min_runtime_secs.map(secs),
            max_runtime: self.max_runtime_secs.map(secs),
            min_timeout: self.min_timeout_secs.map(secs),
            max_timeout: self.max_timeout_secs.map(secs),
            time_windows,
            critically_needed: entity(&self.critically_needed_entity),
            groups: self.groups.clone(),
        })
    }

    fn kind(&self, field: &str) -> Result<ConsumerKind, ConfigError> {
        if let Some(s) = &self.simple {
            return Ok(ConsumerKind::Simple(SimpleConsumer::new(s.switch_entity.as_str())));
        }
        if let Some(c) = &self.cooling {
            return Ok(ConsumerKind::Cooling(CoolingConsumer::new(
                c.switch_entity.as_str(),
                c.temperature_entity.as_str(),
                c.target_temperature,
                c.max_temperature,
            )));
        }
        if let Some(t) = &self.triggered {
            return Ok(ConsumerKind::Triggered(TriggeredConsumer::new(
                t.state_entity.as_str(),
                t.switch_entity.as_str(),
                t.start_state.clone(),
                t.critical_state.clone(),
                t.phases
                    .iter()
                    .map(|p| (p.state.clone(), p.peak_load))
                    .collect(),
                t.can_force_shutdown,
            )));
        }
        if let Some(c) = &self.car_charger {
            let charger = CarChargerConsumer::new(
                CarChargerEntities {
                    current: c.current_entity.as_str().into(),
                    cable_connected: c.cable_connected_entity.as_str().into(),
                    at_home: entity(&c.at_home_entity),
                    battery_level: entity(&c.battery_level_entity),
                    target_level: entity(&c.target_level_entity),
                },
                c.min_current,
                c.max_current,
                c.off_current,
                c.voltage,
            )
            .with_balancing(
                BalancingMethod::parse_or_default(&c.balancing_method),
                c.balance_on_behalf_of.clone(),
            )
            .with_battery_power(c.allow_battery_power);
            return Ok(ConsumerKind::CarCharger(charger));
        }
        Err(ConfigError {
            field: field.to_string(),
            message: "needs one of simple, cooling, triggered or car_charger".to_string(),
        })
    }

    /// Builds the consumer. Call [`InstallationConfig::validate`] first.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for unparsable time windows or a missing variant.
    pub fn build(&self) -> Result<Consumer, ConfigError> {
        let field = format!("consumers.{}", self.name);
        let settings = self.settings(&field)?;
        let kind = self.kind(&field)?;
        Ok(Consumer::new(self.name.clone(), settings, kind))
    }
}

/// Uncontrolled household base load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseLoadConfig {
    /// Average demand (W).
    pub base_w: f64,
    /// Daily sinusoidal swing (W).
    pub amp_w: f64,
    /// Phase offset (radians).
    pub phase_rad: f64,
    /// Gaussian noise standard deviation (W).
    pub noise_std_w: f64,
}

impl Default for BaseLoadConfig {
    fn default() -> Self {
        Self {
            base_w: 450.0,
            amp_w: 250.0,
            phase_rad: 4.2,
            noise_std_w: 60.0,
        }
    }
}

/// Rooftop solar production.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolarConfig {
    /// Clear-sky production at solar noon (W).
    pub peak_w: f64,
    /// Hours since midnight.
    pub sunrise_hour: f64,
    /// Hours since midnight.
    pub sunset_hour: f64,
    /// Relative noise standard deviation.
    pub noise_std: f64,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            peak_w: 5000.0,
            sunrise_hour: 6.0,
            sunset_hour: 21.0,
            noise_std: 0.05,
        }
    }
}

/// Simulated car plugged into the charger.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CarSimConfig {
    /// Hour the car gets connected.
    pub arrival_hour: f64,
    /// Car battery capacity (kWh).
    pub battery_kwh: f64,
    /// Battery level at arrival (%).
    pub initial_level: f64,
}

impl Default for CarSimConfig {
    fn default() -> Self {
        Self {
            arrival_hour: 9.0,
            battery_kwh: 60.0,
            initial_level: 40.0,
        }
    }
}

/// Household simulation parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Start instant, `YYYY-MM-DDTHH:MM:SS`.
    pub start: String,
    /// Step length (s, must be > 0).
    pub step_secs: u64,
    /// Number of steps (must be > 0).
    pub steps: usize,
    /// Master random seed.
    pub seed: u64,
    /// Contracted peak import reported by the meter (kW).
    pub peak_import_kw: f64,
    /// Grid voltage (V).
    pub voltage: f64,
    /// Hour at which triggered appliances report ready.
    pub appliance_ready_hour: f64,
    /// Length of each appliance program phase (min).
    pub appliance_phase_minutes: u64,
    pub base_load: BaseLoadConfig,
    pub solar: SolarConfig,
    pub car: CarSimConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start: "2024-06-01T00:00:00".to_string(),
            step_secs: 60,
            steps: 1440,
            seed: 42,
            peak_import_kw: 4.0,
            voltage: 230.0,
            appliance_ready_hour: 9.0,
            appliance_phase_minutes: 20,
            base_load: BaseLoadConfig::default(),
            solar: SolarConfig::default(),
            car: CarSimConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn start_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.start, "%Y-%m-%dT%H:%M:%S").ok()
    }

    pub fn step(&self) -> TimeDelta {
        secs(self.step_secs)
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"consumers.fridge.peak_load"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Finite and above zero. NaN and infinities fail.
fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn error(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError {
        field: field.into(),
        message: message.into(),
    }
}

fn fridge() -> ConsumerConfig {
    ConsumerConfig {
        name: "fridge".to_string(),
        power_entity: Some("sensor.fridge_power".to_string()),
        peak_load: 150.0,
        switch_on_load: Some(2500.0),
        switch_off_load: Some(3500.0),
        min_runtime_secs: Some(600),
        max_timeout_secs: Some(3 * 3600),
        cooling: Some(CoolingConfig {
            switch_entity: "switch.fridge".to_string(),
            temperature_entity: "sensor.fridge_temperature".to_string(),
            target_temperature: 6.0,
            max_temperature: 9.0,
        }),
        ..ConsumerConfig::default()
    }
}

fn washer() -> ConsumerConfig {
    ConsumerConfig {
        name: "washer".to_string(),
        peak_load: 2000.0,
        switch_on_load: Some(-500.0),
        switch_off_load: Some(1500.0),
        max_timeout_secs: Some(6 * 3600),
        time_windows: vec![TimeWindowConfig {
            start: "08:00".to_string(),
            end: "20:00".to_string(),
            ..TimeWindowConfig::default()
        }],
        groups: vec!["appliances".to_string()],
        triggered: Some(TriggeredConfig {
            state_entity: "sensor.washer_program".to_string(),
            switch_entity: "switch.washer".to_string(),
            start_state: "ready".to_string(),
            critical_state: None,
            phases: vec![
                PhaseConfig {
                    state: "prewash".to_string(),
                    peak_load: 300.0,
                },
                PhaseConfig {
                    state: "heating".to_string(),
                    peak_load: 2000.0,
                },
                PhaseConfig {
                    state: "washing".to_string(),
                    peak_load: 400.0,
                },
                PhaseConfig {
                    state: "spinning".to_string(),
                    peak_load: 600.0,
                },
            ],
            can_force_shutdown: false,
        }),
        ..ConsumerConfig::default()
    }
}

fn dishwasher() -> ConsumerConfig {
    ConsumerConfig {
        name: "dishwasher".to_string(),
        peak_load: 1800.0,
        switch_on_load: Some(-300.0),
        switch_off_load: Some(1000.0),
        min_runtime_secs: Some(15 * 60),
        max_runtime_secs: Some(2 * 3600),
        min_timeout_secs: Some(4 * 3600),
        time_windows: vec![TimeWindowConfig {
            start: "10:00".to_string(),
            end: "17:00".to_string(),
            ..TimeWindowConfig::default()
        }],
        simple: Some(SimpleConfig {
            switch_entity: "switch.dishwasher".to_string(),
        }),
        ..ConsumerConfig::default()
    }
}

fn car(method: &str, on_behalf_of: Option<&str>) -> ConsumerConfig {
    ConsumerConfig {
        name: "car".to_string(),
        peak_load: 6.0 * 230.0,
        switch_on_load: Some(-6.0 * 230.0),
        car_charger: Some(CarChargerConfig {
            balancing_method: method.to_string(),
            balance_on_behalf_of: on_behalf_of.map(str::to_string),
            ..CarChargerConfig::default()
        }),
        ..ConsumerConfig::default()
    }
}

impl InstallationConfig {
    /// A sunny day: fridge, washer, dishwasher and a solar-only car charger.
    pub fn solar_day() -> Self {
        Self {
            engine: EngineConfig::default(),
            grid: GridConfig::default(),
            batteries: vec![BatteryConfig::default()],
            consumers: vec![fridge(), washer(), dishwasher(), car("solar_only", None)],
            simulation: SimulationConfig::default(),
        }
    }

    /// Tight 2.5 kW connection, heavy evening base load and a charger that
    /// fills up to the peak but volunteers headroom for everyone.
    pub fn peak_stress() -> Self {
        Self {
            engine: EngineConfig::default(),
            grid: GridConfig::default(),
            batteries: vec![BatteryConfig {
                capacity_kwh: 5.0,
                max_charge_power_w: 2500.0,
                max_discharge_power_w: 2500.0,
                ..BatteryConfig::default()
            }],
            consumers: vec![
                fridge(),
                washer(),
                dishwasher(),
                ConsumerConfig {
                    min_runtime_secs: Some(300),
                    ..car("max_peak", Some("all"))
                },
            ],
            simulation: SimulationConfig {
                peak_import_kw: 2.5,
                base_load: BaseLoadConfig {
                    base_w: 900.0,
                    amp_w: 500.0,
                    ..BaseLoadConfig::default()
                },
                solar: SolarConfig {
                    peak_w: 2500.0,
                    ..SolarConfig::default()
                },
                ..SimulationConfig::default()
            },
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["solar_day", "peak_stress"];

    /// Loads an installation from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "solar_day" => Ok(Self::solar_day()),
            "peak_stress" => Ok(Self::peak_stress()),
            _ => Err(error(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Parses an installation from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| error("scenario", format!("cannot read \"{}\": {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parses an installation from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| error("toml", e.to_string()))
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let e = &self.engine;
        if e.guard_interval_secs == 0 {
            errors.push(error("engine.guard_interval_secs", "must be > 0"));
        }
        if e.history_capacity == 0 {
            errors.push(error("engine.history_capacity", "must be > 0"));
        }

        for (i, b) in self.batteries.iter().enumerate() {
            let field = format!("batteries[{i}]");
            if !positive(b.capacity_kwh) {
                errors.push(error(format!("{field}.capacity_kwh"), "must be > 0"));
            }
            if !positive(b.max_charge_power_w) {
                errors.push(error(format!("{field}.max_charge_power_w"), "must be > 0"));
            }
            if !positive(b.max_discharge_power_w) {
                errors.push(error(format!("{field}.max_discharge_power_w"), "must be > 0"));
            }
        }

        let mut names = HashSet::new();
        for (i, c) in self.consumers.iter().enumerate() {
            let field = if c.name.is_empty() {
                format!("consumers[{i}]")
            } else {
                format!("consumers.{}", c.name)
            };
            if c.name.is_empty() {
                errors.push(error(format!("{field}.name"), "must not be empty"));
            } else if !names.insert(c.name.as_str()) {
                errors.push(error(format!("{field}.name"), "must be unique"));
            }
            if !(c.peak_load >= 0.0) {
                errors.push(error(format!("{field}.peak_load"), "must be >= 0"));
            }
            if let (Some(min), Some(max)) = (c.min_runtime_secs, c.max_runtime_secs) {
                if min > max {
                    errors.push(error(
                        format!("{field}.min_runtime_secs"),
                        "must be <= max_runtime_secs",
                    ));
                }
            }
            if let (Some(min), Some(max)) = (c.min_timeout_secs, c.max_timeout_secs) {
                if min > max {
                    errors.push(error(
                        format!("{field}.min_timeout_secs"),
                        "must be <= max_timeout_secs",
                    ));
                }
            }
            for (w, window) in c.time_windows.iter().enumerate() {
                if let Err(err) = window.build(&format!("{field}.time_windows[{w}]")) {
                    errors.push(err);
                }
            }

            match c.variant_count() {
                1 => {}
                0 => errors.push(error(
                    field.clone(),
                    "needs one of simple, cooling, triggered or car_charger",
                )),
                _ => errors.push(error(field.clone(), "only one variant table allowed")),
            }
            if let Some(cooling) = &c.cooling {
                if !(cooling.max_temperature >= cooling.target_temperature) {
                    errors.push(error(
                        format!("{field}.cooling.max_temperature"),
                        "must be >= target_temperature",
                    ));
                }
            }
            if let Some(charger) = &c.car_charger {
                if !positive(charger.voltage) {
                    errors.push(error(format!("{field}.car_charger.voltage"), "must be > 0"));
                }
                if !(charger.min_current > charger.off_current) {
                    errors.push(error(
                        format!("{field}.car_charger.min_current"),
                        "must be > off_current",
                    ));
                }
                if !(charger.max_current >= charger.min_current) {
                    errors.push(error(
                        format!("{field}.car_charger.max_current"),
                        "must be >= min_current",
                    ));
                }
            }
        }

        let s = &self.simulation;
        if s.start_at().is_none() {
            errors.push(error(
                "simulation.start",
                format!("invalid instant \"{}\", expected YYYY-MM-DDTHH:MM:SS", s.start),
            ));
        }
        if s.step_secs == 0 {
            errors.push(error("simulation.step_secs", "must be > 0"));
        }
        if s.steps == 0 {
            errors.push(error("simulation.steps", "must be > 0"));
        }
        if !positive(s.voltage) {
            errors.push(error("simulation.voltage", "must be > 0"));
        }
        let sol = &s.solar;
        if !(0.0..=24.0).contains(&sol.sunrise_hour)
            || !(0.0..=24.0).contains(&sol.sunset_hour)
            || sol.sunrise_hour >= sol.sunset_hour
        {
            errors.push(error(
                "simulation.solar.sunrise_hour",
                "must be < sunset_hour, both within 0-24",
            ));
        }
        if !positive(s.car.battery_kwh) {
            errors.push(error("simulation.car.battery_kwh", "must be > 0"));
        }

        errors
    }

    /// Builds every consumer in list order.
    ///
    /// # Errors
    ///
    /// Returns the first build failure.
    pub fn build_consumers(&self) -> Result<Vec<Consumer>, ConfigError> {
        self.consumers.iter().map(ConsumerConfig::build).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for name in InstallationConfig::PRESETS {
            let cfg = InstallationConfig::from_preset(name).expect("known preset");
            let errors = cfg.validate();
            assert!(errors.is_empty(), "{name} should be valid: {errors:?}");
            assert!(cfg.build_consumers().is_ok());
        }
    }

    #[test]
    fn from_preset_unknown() {
        let err = InstallationConfig::from_preset("nonexistent");
        assert!(err.is_err_and(|e| e.message.contains("unknown preset")));
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[engine]
guard_interval_secs = 5
manage_debounce_ms = 0

[grid]
import_entity = "sensor.p1_import"
export_entity = "sensor.p1_export"
peak_import_entity = "sensor.p1_peak"

[[batteries]]
name = "garage"
capacity_kwh = 7.5
max_charge_power_w = 3000.0
max_discharge_power_w = 3000.0
max_charge_power_entity = "number.garage_charge"
max_discharge_power_entity = "number.garage_discharge"

[[consumers]]
name = "boiler"
peak_load = 2200.0
switch_on_load = -1500.0
switch_off_load = 500.0
max_runtime_secs = 7200

[[consumers.time_windows]]
start = "22:00"
end = "02:00"
days = ["mon", "Tuesday"]

[consumers.simple]
switch_entity = "switch.boiler"

[[consumers]]
name = "car"
peak_load = 1380.0

[consumers.car_charger]
balancing_method = "near_peak"
balance_on_behalf_of = "all"
"#;
        let cfg = InstallationConfig::from_toml_str(toml).expect("valid TOML should parse");
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
        assert_eq!(cfg.engine.guard_interval_secs, 5);
        assert_eq!(cfg.engine.report_debounce_ms, 1000);
        assert_eq!(cfg.consumers.len(), 2);
        assert_eq!(cfg.batteries[0].name, "garage");

        let consumers = cfg.build_consumers().expect("buildable");
        assert_eq!(consumers[0].kind().name(), "simple");
        assert_eq!(consumers[0].switch_off_load(), 500.0);
        assert_eq!(consumers[1].switch_off_load(), f64::INFINITY);
        assert_eq!(
            consumers[1].dynamic().map(|d| d.balancing_method()),
            Some(BalancingMethod::NearPeak)
        );
    }

    #[test]
    fn unknown_field_is_rejected() {
        let toml = r#"
[engine]
guard_interval_secs = 10
bogus_field = true
"#;
        assert!(InstallationConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn validation_catches_missing_variant_and_duplicates() {
        let mut cfg = InstallationConfig::solar_day();
        cfg.consumers.push(ConsumerConfig {
            name: "fridge".to_string(),
            ..ConsumerConfig::default()
        });
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "consumers.fridge.name"));
        assert!(errors.iter().any(|e| e.message.contains("needs one of")));
    }

    #[test]
    fn validation_catches_bad_window() {
        let mut cfg = InstallationConfig::solar_day();
        cfg.consumers[2].time_windows[0].end = "25:99".to_string();
        let errors = cfg.validate();
        assert!(
            errors
                .iter()
                .any(|e| e.field == "consumers.dishwasher.time_windows[0].end")
        );
    }

    #[test]
    fn validation_catches_charger_currents() {
        let mut cfg = InstallationConfig::solar_day();
        if let Some(charger) = cfg.consumers[3].car_charger.as_mut() {
            charger.min_current = 0.0;
        }
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "consumers.car.car_charger.min_current"));
    }

    #[test]
    fn validation_rejects_nan_before_construction() {
        let mut cfg = InstallationConfig::solar_day();
        if let Some(charger) = cfg.consumers[3].car_charger.as_mut() {
            charger.voltage = f64::NAN;
            charger.max_current = f64::NAN;
        }
        if let Some(cooling) = cfg.consumers[0].cooling.as_mut() {
            cooling.max_temperature = f64::NAN;
        }
        cfg.simulation.voltage = f64::NAN;

        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "consumers.car.car_charger.voltage"));
        assert!(errors.iter().any(|e| e.field == "consumers.car.car_charger.max_current"));
        assert!(errors.iter().any(|e| e.field == "consumers.fridge.cooling.max_temperature"));
        assert!(errors.iter().any(|e| e.field == "simulation.voltage"));
    }

    #[test]
    fn nan_voltage_in_toml_is_rejected() {
        let toml = r#"
[[consumers]]
name = "car"

[consumers.car_charger]
voltage = nan
"#;
        let cfg = InstallationConfig::from_toml_str(toml).expect("nan is a TOML float");
        assert!(
            cfg.validate()
                .iter()
                .any(|e| e.field == "consumers.car.car_charger.voltage")
        );
    }

    #[test]
    fn validation_rejects_zero_battery_power() {
        let mut cfg = InstallationConfig::solar_day();
        cfg.batteries[0].max_discharge_power_w = 0.0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "batteries[0].max_discharge_power_w"));
        assert!(!errors.iter().any(|e| e.field == "batteries[0].max_charge_power_w"));
    }

    #[test]
    fn validation_catches_bad_simulation_start() {
        let mut cfg = InstallationConfig::solar_day();
        cfg.simulation.start = "yesterday".to_string();
        assert!(cfg.validate().iter().any(|e| e.field == "simulation.start"));
    }

    #[test]
    fn engine_settings_follow_config() {
        let cfg = EngineConfig {
            manage_debounce_ms: 0,
            ..EngineConfig::default()
        };
        let settings = cfg.settings();
        assert_eq!(settings.manage_debounce, TimeDelta::zero());
        assert_eq!(settings.guard_interval, TimeDelta::seconds(10));
        assert_eq!(settings.min_change_interval, TimeDelta::seconds(30));
    }
}
