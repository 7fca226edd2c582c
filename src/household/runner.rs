//! Drives an orchestrator against a [`SimulatedHome`] on virtual time.

use chrono::NaiveDateTime;

use super::home::{HomeSample, SimulatedHome};
use super::kpi::{CommandCounts, KpiReport};
use crate::config::{ConfigError, InstallationConfig};
use crate::devices::ConsumerState;
use crate::engine::{Orchestrator, Scheduler, VirtualScheduler};
use crate::entity::Command;
use crate::report::{MemoryReportSink, StateReport};

/// Command/echo rounds allowed per instant before the loop is cut off.
const MAX_ECHO_ROUNDS: usize = 16;

/// One simulated step as seen from the meter.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub step: usize,
    pub time: NaiveDateTime,
    pub sample: HomeSample,
    /// Peak limit the orchestrator enforced (W).
    pub peak_w: f64,
    /// Aggregate consumer state after the step.
    pub state: ConsumerState,
    /// Names of running consumers, `;`-separated.
    pub running: String,
    /// Any battery allowed to discharge.
    pub discharge_enabled: bool,
    pub car_level: Option<f64>,
}

impl TelemetryRow {
    pub fn over_peak(&self) -> bool {
        self.sample.import_w > self.peak_w
    }
}

/// Everything a simulation run produced.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub telemetry: Vec<TelemetryRow>,
    pub kpis: KpiReport,
    pub reports: Vec<StateReport>,
}

/// Carries out every queued command and feeds the echoed states back until
/// the orchestrator goes quiet.
fn pump(
    orchestrator: &mut Orchestrator<VirtualScheduler>,
    home: &mut SimulatedHome,
    counts: &mut CommandCounts,
) {
    for _ in 0..MAX_ECHO_ROUNDS {
        let commands = orchestrator.take_commands();
        if commands.is_empty() {
            return;
        }
        for command in &commands {
            match command {
                Command::TurnOn(_) => counts.switch_on += 1,
                Command::TurnOff(_) => counts.switch_off += 1,
                Command::SetNumber { .. } => counts.set_points += 1,
            }
            for event in home.apply(command) {
                orchestrator.publish(event);
            }
        }
    }
    tracing::warn!(at = %orchestrator.now(), "command loop did not settle");
}

/// Runs the installation's simulation from start to end.
///
/// Each step first fires every engine timer due before the step instant,
/// applying commands as they appear, then advances the house and publishes
/// its sensor readings.
///
/// # Errors
///
/// Returns every validation error found in `config`.
pub fn run_simulation(config: &InstallationConfig) -> Result<SimulationResult, Vec<ConfigError>> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(errors);
    }
    let sim = &config.simulation;
    let Some(start) = sim.start_at() else {
        return Err(vec![ConfigError {
            field: "simulation.start".to_string(),
            message: "invalid instant".to_string(),
        }]);
    };
    let step = sim.step();

    let sink = MemoryReportSink::new();
    let mut orchestrator =
        Orchestrator::from_config(config, VirtualScheduler::new(start))?.with_sink(sink.clone());
    let mut home = SimulatedHome::from_config(config);
    let mut counts = CommandCounts::default();

    for event in home.initial_events() {
        orchestrator.publish(event);
    }
    orchestrator.start();
    pump(&mut orchestrator, &mut home, &mut counts);

    tracing::info!(
        %start,
        steps = sim.steps,
        step_secs = sim.step_secs,
        consumers = orchestrator.consumers().len(),
        "simulation started"
    );

    let mut telemetry = Vec::with_capacity(sim.steps);
    for index in 0..sim.steps {
        let at = orchestrator.now() + step;
        while let Some(due) = orchestrator.scheduler().next_due() {
            if due > at {
                break;
            }
            orchestrator.run_until(due);
            pump(&mut orchestrator, &mut home, &mut counts);
        }
        orchestrator.run_until(at);

        let (sample, events) = home.step(at, step);
        for event in events {
            orchestrator.publish(event);
        }
        pump(&mut orchestrator, &mut home, &mut counts);

        let row = TelemetryRow {
            step: index,
            time: at,
            sample,
            peak_w: orchestrator.monitor().peak_load(),
            state: orchestrator.state(),
            running: orchestrator
                .consumers()
                .iter()
                .filter(|c| c.is_running())
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(";"),
            discharge_enabled: orchestrator.batteries().iter().any(|b| b.can_discharge()),
            car_level: home.car_level(),
        };
        if row.over_peak() {
            tracing::debug!(
                step = index,
                import = sample.import_w,
                peak = row.peak_w,
                "above peak"
            );
        }
        telemetry.push(row);
    }

    orchestrator.shutdown();
    let kpis = KpiReport::from_rows(&telemetry, step, counts);
    tracing::info!(
        peak_import_w = kpis.peak_import_w,
        steps_over_peak = kpis.steps_over_peak,
        "simulation finished"
    );

    Ok(SimulationResult {
        telemetry,
        kpis,
        reports: sink.reports(),
    })
}
