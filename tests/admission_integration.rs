//! Integration tests for admission, eviction and dynamic load balancing.

mod common;

use std::sync::atomic::Ordering;

use peak_guard::devices::consumer::BalancingMethod;
use peak_guard::devices::ConsumerSettings;
use peak_guard::entity::{Command, EntityEvent, EntityId};

use common::{
    BATTERY_DISCHARGE, CAR_CABLE, CAR_CURRENT, battery, charger, debounced_orchestrator,
    open_settings, publish_grid, socket, socket_with, turned_off, turned_on,
};

fn running_heater(switch_off_load: f64) -> common::TestOrchestrator {
    let mut o = debounced_orchestrator().with_consumer(socket(
        "heater",
        1000.0,
        f64::INFINITY,
        switch_off_load,
    ));
    publish_grid(&mut o, 4.0, 4500.0, 0.0);
    o.publish(EntityEvent::binary("switch.heater", true));
    o.start();
    assert!(o.consumer("heater").is_some_and(|c| c.is_running()));
    o
}

#[test]
fn heater_shed_when_threshold_exceeded_above_peak() {
    let mut o = running_heater(1000.0);
    let outcome = o.manage();

    assert_eq!(outcome.evicted, vec!["heater".to_string()]);
    assert_eq!(outcome.estimated_load, 3500.0);
    assert!(outcome.estimated_load < 4000.0);
    assert!(turned_off(&o.take_commands(), "heater"));
}

#[test]
fn heater_without_threshold_evicted_to_protect_peak() {
    let mut o = running_heater(f64::INFINITY);
    let outcome = o.manage();

    assert_eq!(outcome.evicted, vec!["heater".to_string()]);
    assert!(outcome.estimated_load <= 4000.0);
    assert!(turned_off(&o.take_commands(), "heater"));
}

#[test]
fn hard_eviction_sheds_only_what_is_needed() {
    let mut o = debounced_orchestrator()
        .with_consumer(socket_with("a", open_settings(1000.0)))
        .with_consumer(socket_with("b", open_settings(1000.0)));
    publish_grid(&mut o, 4.0, 4500.0, 0.0);
    o.publish(EntityEvent::binary("switch.a", true));
    o.publish(EntityEvent::binary("switch.b", true));
    o.start();

    let outcome = o.manage();
    assert_eq!(outcome.evicted, vec!["a".to_string()]);
    assert_eq!(outcome.estimated_load, 3500.0);

    let commands = o.take_commands();
    assert!(turned_off(&commands, "a"));
    assert!(!turned_off(&commands, "b"));
}

#[test]
fn consumer_within_min_runtime_is_not_evicted() {
    let mut o = debounced_orchestrator().with_consumer(socket_with(
        "pump",
        ConsumerSettings {
            min_runtime: Some(chrono::TimeDelta::minutes(10)),
            ..open_settings(1000.0)
        },
    ));
    publish_grid(&mut o, 4.0, 4500.0, 0.0);
    o.publish(EntityEvent::binary("switch.pump", true));
    o.start();

    let outcome = o.manage();
    assert!(outcome.evicted.is_empty());
    assert!(o.take_commands().is_empty());
}

#[test]
fn switch_on_threshold_gates_admission() {
    let mut o = debounced_orchestrator()
        .with_consumer(socket("b", 100.0, -60.0, f64::INFINITY))
        .with_consumer(socket("a", 100.0, -40.0, f64::INFINITY));
    publish_grid(&mut o, 4.0, 0.0, 50.0);
    o.start();

    let outcome = o.manage();
    assert_eq!(outcome.admitted, vec!["a".to_string()]);

    let commands = o.take_commands();
    assert!(turned_on(&commands, "a"));
    assert!(!turned_on(&commands, "b"));
}

#[test]
fn critical_consumer_admitted_before_needy_one() {
    let critical = EntityId::new("input_boolean.freezer_critical");
    let mut o = debounced_orchestrator()
        .with_consumer(socket_with("boiler", open_settings(1200.0)))
        .with_consumer(socket_with(
            "freezer",
            ConsumerSettings {
                critically_needed: Some(critical.clone()),
                ..open_settings(1200.0)
            },
        ));
    publish_grid(&mut o, 4.0, 2500.0, 0.0);
    o.publish(EntityEvent::binary(critical, true));
    o.start();

    let outcome = o.manage();
    assert_eq!(outcome.admitted, vec!["freezer".to_string()]);
    assert_eq!(outcome.estimated_load, 3700.0);
    assert!(!turned_on(&o.take_commands(), "boiler"));
}

#[test]
fn admission_never_plans_above_peak() {
    for import in (0..=5000).step_by(250) {
        let mut o = debounced_orchestrator()
            .with_consumer(socket_with("a", open_settings(1000.0)))
            .with_consumer(socket_with("b", open_settings(1500.0)))
            .with_consumer(socket_with("c", open_settings(700.0)));
        publish_grid(&mut o, 4.0, f64::from(import), 0.0);
        o.start();

        let outcome = o.manage();
        if !outcome.admitted.is_empty() {
            assert!(
                outcome.estimated_load <= 4000.0 && outcome.estimated_average_load <= 4000.0,
                "import {import} W planned {} W",
                outcome.estimated_load
            );
        }
        if import > 4000 {
            assert!(outcome.admitted.is_empty(), "admitted at {import} W");
        }
    }
}

#[test]
fn charger_absorbs_surplus_in_whole_amps() {
    let mut o = debounced_orchestrator()
        .with_consumer(charger(BalancingMethod::SolarOnly, None))
        .with_battery(battery());
    publish_grid(&mut o, 4.0, 0.0, 600.0);
    o.publish(EntityEvent::binary(CAR_CABLE, true));
    o.publish(EntityEvent::number(CAR_CURRENT, 6.0));
    o.publish(EntityEvent::number(BATTERY_DISCHARGE, 5000.0));
    o.start();

    let outcome = o.manage();
    assert_eq!(outcome.dynamic_net_change, 690.0);
    assert!(outcome.evicted.is_empty());

    let commands = o.take_commands();
    assert!(commands.contains(&Command::SetNumber {
        entity: CAR_CURRENT.into(),
        value: 9.0,
    }));
    assert!(commands.contains(&Command::SetNumber {
        entity: BATTERY_DISCHARGE.into(),
        value: 0.0,
    }));
    assert!(!o.batteries()[0].can_discharge());
}

#[test]
fn idle_installation_enables_battery_discharge() {
    let mut o = debounced_orchestrator().with_battery(battery());
    publish_grid(&mut o, 4.0, 1000.0, 0.0);
    o.start();

    o.manage();
    assert_eq!(
        o.take_commands(),
        vec![Command::SetNumber {
            entity: BATTERY_DISCHARGE.into(),
            value: 5000.0,
        }]
    );
    assert!(o.batteries()[0].can_discharge());
}

#[test]
fn pass_skipped_while_gate_held() {
    let mut o = debounced_orchestrator().with_consumer(socket_with("a", open_settings(1000.0)));
    publish_grid(&mut o, 4.0, 0.0, 0.0);
    o.start();

    let gate = o.pass_gate();
    gate.store(true, Ordering::SeqCst);
    let outcome = o.manage();
    assert!(outcome.skipped);
    assert!(o.take_commands().is_empty());

    gate.store(false, Ordering::SeqCst);
    let outcome = o.manage();
    assert!(!outcome.skipped);
    assert_eq!(outcome.admitted, vec!["a".to_string()]);
}

#[test]
fn ramping_consumer_eviction_credits_its_full_peak() {
    let mut o = debounced_orchestrator()
        .with_consumer(socket_with(
            "ramp",
            ConsumerSettings {
                power_entity: Some(EntityId::new("sensor.ramp_power")),
                ..open_settings(2000.0)
            },
        ))
        .with_consumer(socket_with("b", open_settings(1000.0)));
    publish_grid(&mut o, 4.0, 3900.0, 0.0);
    o.publish(EntityEvent::binary("switch.ramp", true));
    o.publish(EntityEvent::number("sensor.ramp_power", 200.0));
    o.publish(EntityEvent::binary("switch.b", true));
    o.start();

    let outcome = o.manage();
    assert_eq!(outcome.evicted, vec!["ramp".to_string()]);
    assert_eq!(outcome.estimated_load, 3700.0);

    let commands = o.take_commands();
    assert!(turned_off(&commands, "ramp"));
    assert!(!turned_off(&commands, "b"));
}

/// Charger at 16 A with 2300 W above its minimum, plus a critical freezer
/// waiting to start at 3900 W import.
fn charger_and_critical_freezer(on_behalf_of: Option<&str>) -> common::TestOrchestrator {
    let critical = EntityId::new("input_boolean.freezer_critical");
    let mut o = debounced_orchestrator()
        .with_consumer(charger(BalancingMethod::MaxPeak, on_behalf_of))
        .with_consumer(socket_with(
            "freezer",
            ConsumerSettings {
                critically_needed: Some(critical.clone()),
                ..open_settings(1200.0)
            },
        ));
    publish_grid(&mut o, 4.0, 3900.0, 0.0);
    o.publish(EntityEvent::binary(CAR_CABLE, true));
    o.publish(EntityEvent::number(CAR_CURRENT, 16.0));
    o.publish(EntityEvent::binary(critical, true));
    o.start();
    assert!(o.consumer("car").is_some_and(|c| c.is_running()));
    o
}

#[test]
fn charger_headroom_admits_critical_consumer_above_peak() {
    let mut o = charger_and_critical_freezer(Some("all"));
    let outcome = o.manage();

    assert_eq!(outcome.dynamic_net_change, 0.0);
    assert_eq!(outcome.admitted, vec!["freezer".to_string()]);
    assert_eq!(outcome.estimated_load, 5100.0);
    // the charger can give the power back, so nothing is shed
    assert!(outcome.evicted.is_empty());

    let commands = o.take_commands();
    assert!(turned_on(&commands, "freezer"));
    assert!(!commands.iter().any(|c| matches!(
        c,
        Command::SetNumber { entity, .. } if *entity == EntityId::from(CAR_CURRENT)
    )));
}

#[test]
fn charger_in_another_group_gives_no_headroom() {
    let mut o = charger_and_critical_freezer(Some("garage"));
    let outcome = o.manage();

    assert!(outcome.admitted.is_empty());
    assert!(outcome.evicted.is_empty());
    assert!(!turned_on(&o.take_commands(), "freezer"));
}

#[test]
fn rebalanced_charger_is_not_hard_evicted_in_the_same_pass() {
    let mut o = debounced_orchestrator()
        .with_consumer(charger(BalancingMethod::MaxPeak, None))
        .with_consumer(socket_with("heater", open_settings(1000.0)));
    publish_grid(&mut o, 4.0, 8000.0, 0.0);
    o.publish(EntityEvent::binary(CAR_CABLE, true));
    o.publish(EntityEvent::number(CAR_CURRENT, 16.0));
    o.publish(EntityEvent::binary("switch.heater", true));
    o.start();

    let outcome = o.manage();
    assert_eq!(outcome.dynamic_net_change, -2300.0);
    assert_eq!(outcome.evicted, vec!["heater".to_string()]);
    assert_eq!(outcome.estimated_load, 4700.0);

    let commands = o.take_commands();
    assert!(commands.contains(&Command::SetNumber {
        entity: CAR_CURRENT.into(),
        value: 6.0,
    }));
    assert!(!commands.contains(&Command::SetNumber {
        entity: CAR_CURRENT.into(),
        value: 0.0,
    }));
    assert!(o.consumer("car").is_some_and(|c| c.is_running()));
}
