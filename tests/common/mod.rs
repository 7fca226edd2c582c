//! Shared test fixtures for integration tests.
#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use peak_guard::devices::consumer::{
    BalancingMethod, CarChargerConsumer, CarChargerEntities, SimpleConsumer,
};
use peak_guard::devices::{
    Battery, BatteryEntities, Consumer, ConsumerKind, ConsumerSettings,
};
use peak_guard::engine::{
    CapacityMonitor, EngineSettings, GridEntities, Orchestrator, VirtualScheduler,
};
use peak_guard::entity::{Command, EntityEvent, EntityId};

pub const IMPORT: &str = "sensor.import";
pub const EXPORT: &str = "sensor.export";
pub const PEAK: &str = "sensor.peak";
pub const CAR_CURRENT: &str = "number.car_current";
pub const CAR_CABLE: &str = "binary_sensor.car_cable";
pub const BATTERY_CHARGE: &str = "number.battery_charge";
pub const BATTERY_DISCHARGE: &str = "number.battery_discharge";

pub type TestOrchestrator = Orchestrator<VirtualScheduler>;

/// Monday 2024-06-03 12:00:00.
pub fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 3)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .expect("valid timestamp")
}

pub fn grid() -> GridEntities {
    GridEntities {
        import: IMPORT.into(),
        export: EXPORT.into(),
        peak_import: PEAK.into(),
        voltage: None,
        average_demand: None,
    }
}

/// Orchestrator on virtual time with the given timings.
pub fn orchestrator_with(settings: EngineSettings) -> TestOrchestrator {
    Orchestrator::new(
        settings,
        VirtualScheduler::new(start()),
        CapacityMonitor::new(grid(), 100),
    )
}

/// Passes and reports run synchronously.
pub fn orchestrator() -> TestOrchestrator {
    orchestrator_with(EngineSettings::immediate())
}

/// Passes are debounced so tests can call `manage` themselves.
pub fn debounced_orchestrator() -> TestOrchestrator {
    orchestrator_with(EngineSettings {
        report_debounce: TimeDelta::zero(),
        ..EngineSettings::default()
    })
}

pub fn switch(name: &str) -> EntityId {
    EntityId::new(format!("switch.{name}"))
}

/// Settings with no thresholds: always admissible, never shed for solar.
pub fn open_settings(peak_load: f64) -> ConsumerSettings {
    ConsumerSettings {
        peak_load,
        switch_on_load: f64::INFINITY,
        switch_off_load: f64::INFINITY,
        ..ConsumerSettings::default()
    }
}

pub fn socket_with(name: &str, settings: ConsumerSettings) -> Consumer {
    Consumer::new(
        name,
        settings,
        ConsumerKind::Simple(SimpleConsumer::new(switch(name))),
    )
}

pub fn socket(name: &str, peak_load: f64, switch_on_load: f64, switch_off_load: f64) -> Consumer {
    socket_with(
        name,
        ConsumerSettings {
            peak_load,
            switch_on_load,
            switch_off_load,
            ..ConsumerSettings::default()
        },
    )
}

/// 6-16 A charger at 230 V, off at 0 A.
pub fn charger(method: BalancingMethod, on_behalf_of: Option<&str>) -> Consumer {
    let kind = CarChargerConsumer::new(
        CarChargerEntities {
            current: CAR_CURRENT.into(),
            cable_connected: CAR_CABLE.into(),
            at_home: None,
            battery_level: None,
            target_level: None,
        },
        6.0,
        16.0,
        0.0,
        230.0,
    )
    .with_balancing(method, on_behalf_of.map(str::to_string));
    Consumer::new(
        "car",
        open_settings(6.0 * 230.0),
        ConsumerKind::CarCharger(kind),
    )
}

pub fn battery() -> Battery {
    Battery::new(
        "house",
        10.0,
        5000.0,
        5000.0,
        BatteryEntities {
            power: None,
            state_of_charge: None,
            energy: None,
            max_charge_power: BATTERY_CHARGE.into(),
            max_discharge_power: BATTERY_DISCHARGE.into(),
        },
    )
}

/// Publishes a contracted peak (kW) and a grid reading (W).
pub fn publish_grid(o: &mut TestOrchestrator, peak_kw: f64, import_w: f64, export_w: f64) {
    o.publish(EntityEvent::number(PEAK, peak_kw));
    o.publish(EntityEvent::number(IMPORT, import_w));
    o.publish(EntityEvent::number(EXPORT, export_w));
}

/// Drains commands and feeds each one back as the device's confirmed state.
pub fn confirm(o: &mut TestOrchestrator) -> Vec<Command> {
    let commands = o.take_commands();
    for command in &commands {
        let echo = match command {
            Command::TurnOn(e) => EntityEvent::binary(e.clone(), true),
            Command::TurnOff(e) => EntityEvent::binary(e.clone(), false),
            Command::SetNumber { entity, value } => EntityEvent::number(entity.clone(), *value),
        };
        o.publish(echo);
    }
    commands
}

pub fn turned_on(commands: &[Command], name: &str) -> bool {
    commands.contains(&Command::TurnOn(switch(name)))
}

pub fn turned_off(commands: &[Command], name: &str) -> bool {
    commands.contains(&Command::TurnOff(switch(name)))
}
