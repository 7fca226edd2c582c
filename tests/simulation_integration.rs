//! Integration tests for configuration loading and full simulated days.

mod common;

use std::path::Path;
use std::process::Command;

use chrono::Timelike;
use peak_guard::config::InstallationConfig;
use peak_guard::engine::{Orchestrator, VirtualScheduler};
use peak_guard::household::run_simulation;
use peak_guard::io::export::write_csv;

fn short(mut config: InstallationConfig, steps: usize) -> InstallationConfig {
    config.simulation.steps = steps;
    config
}

#[test]
fn every_preset_builds_an_orchestrator() {
    for name in InstallationConfig::PRESETS {
        let config = InstallationConfig::from_preset(name).expect("preset exists");
        let o = Orchestrator::from_config(&config, VirtualScheduler::new(common::start()))
            .unwrap_or_else(|e| panic!("preset {name} rejected: {e:?}"));
        assert_eq!(o.consumers().len(), config.consumers.len());
        assert_eq!(o.batteries().len(), config.batteries.len());
        assert!(!o.is_started());
    }
}

#[test]
fn scenario_files_are_valid() {
    for path in ["scenarios/winter_evening.toml", "scenarios/sunny_weekend.toml"] {
        let config = InstallationConfig::from_toml_file(Path::new(path))
            .unwrap_or_else(|e| panic!("{path}: {e}"));
        assert!(config.validate().is_empty(), "{path}: {:?}", config.validate());
        assert!(Orchestrator::from_config(&config, VirtualScheduler::new(common::start())).is_ok());
    }
}

#[test]
fn invalid_config_lists_every_problem() {
    let mut config = InstallationConfig::solar_day();
    config.engine.guard_interval_secs = 0;
    config.consumers[1].name = config.consumers[0].name.clone();

    let errors = Orchestrator::from_config(&config, VirtualScheduler::new(common::start()))
        .err()
        .unwrap_or_default();
    assert!(errors.iter().any(|e| e.field == "engine.guard_interval_secs"));
    assert!(errors.iter().any(|e| e.message == "must be unique"));
}

#[test]
fn peak_stress_day_runs_to_completion() {
    let config = InstallationConfig::peak_stress();
    let result = run_simulation(&config).expect("preset is valid");

    assert_eq!(result.telemetry.len(), config.simulation.steps);
    assert!(result.telemetry.windows(2).all(|w| w[0].time < w[1].time));
    assert!(result.telemetry.iter().all(|r| r.peak_w == 2500.0));
    assert!(result.kpis.peak_import_w.is_finite());
    assert!(result.kpis.import_kwh > 0.0);
    assert!(result.kpis.steps_over_peak <= result.telemetry.len());
    assert!(!result.reports.is_empty());
}

#[test]
fn fridge_is_switched_on_during_a_solar_day() {
    let result =
        run_simulation(&short(InstallationConfig::solar_day(), 120)).expect("preset is valid");
    assert!(result.kpis.commands.switch_on > 0);
    assert!(result.telemetry.iter().any(|r| r.running.split(';').any(|n| n == "fridge")));
}

#[test]
fn seed_changes_the_household() {
    let config = short(InstallationConfig::solar_day(), 180);
    let mut reseeded = config.clone();
    reseeded.simulation.seed = config.simulation.seed + 1;

    let a = run_simulation(&config).expect("valid");
    let b = run_simulation(&config).expect("valid");
    let c = run_simulation(&reseeded).expect("valid");
    assert_eq!(a.telemetry, b.telemetry);
    assert_ne!(a.telemetry, c.telemetry);
}

#[test]
fn boiler_runs_only_inside_its_night_window() {
    let config = InstallationConfig::from_toml_file(Path::new("scenarios/winter_evening.toml"))
        .expect("scenario parses");
    let result = run_simulation(&config).expect("scenario is valid");

    for row in &result.telemetry {
        if row.running.split(';').any(|n| n == "boiler") {
            let hour = row.time.hour();
            assert!(
                !(6..22).contains(&hour) || (hour == 6 && row.time.minute() == 0),
                "boiler running at {}",
                row.time
            );
        }
    }
}

#[test]
fn telemetry_csv_has_one_line_per_step() {
    let result = run_simulation(&short(InstallationConfig::solar_day(), 30)).expect("valid");
    let mut buffer = Vec::new();
    write_csv(&result.telemetry, &mut buffer).expect("in-memory write");

    let text = String::from_utf8(buffer).expect("csv is UTF-8");
    let mut lines = text.lines();
    assert!(lines.next().is_some_and(|h| h.starts_with("step,time,")));
    assert_eq!(lines.count(), 30);
}

#[test]
fn scenarios_run_via_cli_and_differ() {
    let winter = run_and_parse_peak("scenarios/winter_evening.toml");
    let summer = run_and_parse_peak("scenarios/sunny_weekend.toml");
    assert!(
        (winter - summer).abs() > 0.5,
        "expected different peak imports: winter={winter}, summer={summer}"
    );
}

#[test]
fn cli_rejects_conflicting_sources() {
    let output = Command::new(env!("CARGO_BIN_EXE_peak-guard"))
        .args(["--scenario", "scenarios/winter_evening.toml", "--preset", "solar_day"])
        .output()
        .expect("peak-guard process should run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("mutually exclusive"));
}

#[test]
fn cli_rejects_unknown_preset() {
    let output = Command::new(env!("CARGO_BIN_EXE_peak-guard"))
        .args(["--preset", "nope"])
        .output()
        .expect("peak-guard process should run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown preset"));
}

fn run_and_parse_peak(path: &str) -> f64 {
    let output = Command::new(env!("CARGO_BIN_EXE_peak-guard"))
        .args(["--scenario", path])
        .output()
        .expect("peak-guard process should run");

    assert!(
        output.status.success(),
        "scenario run failed for {path}: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8(output.stdout).expect("stdout should be valid UTF-8");
    let line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with("Peak import:"))
        .unwrap_or_else(|| panic!("missing peak import line in output: {stdout}"));
    let raw = line
        .split_once(':')
        .map(|(_, right)| right.trim())
        .unwrap_or_else(|| panic!("invalid KPI format for line `{line}`"));
    let numeric = raw.strip_suffix('W').unwrap_or(raw).trim();
    numeric
        .parse::<f64>()
        .unwrap_or_else(|_| panic!("failed parsing `{numeric}` from KPI line `{line}`"))
}
