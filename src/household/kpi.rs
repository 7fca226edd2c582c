//! Post-hoc KPI computation from simulation telemetry.

use std::fmt;

use chrono::TimeDelta;

use super::runner::TelemetryRow;

/// Commands the orchestrator issued during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandCounts {
    pub switch_on: usize,
    pub switch_off: usize,
    pub set_points: usize,
}

/// Aggregate indicators of a complete simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct KpiReport {
    /// Highest import seen by the meter (W).
    pub peak_import_w: f64,
    /// Highest export seen by the meter (W).
    pub peak_export_w: f64,
    /// Steps where import exceeded the enforced peak.
    pub steps_over_peak: usize,
    pub import_kwh: f64,
    pub export_kwh: f64,
    /// Share of solar production used in the house (%).
    pub self_consumption_pct: f64,
    /// Energy delivered to controllable devices (kWh).
    pub controlled_kwh: f64,
    pub commands: CommandCounts,
    /// Car battery level at the end of the run (%).
    pub final_car_level: Option<f64>,
}

impl KpiReport {
    /// Computes all KPIs from the telemetry rows.
    ///
    /// # Arguments
    ///
    /// * `rows` - Complete simulation telemetry
    /// * `step` - Step length
    /// * `commands` - Commands counted while the run was pumped
    pub fn from_rows(rows: &[TelemetryRow], step: TimeDelta, commands: CommandCounts) -> Self {
        let hours = step.num_milliseconds() as f64 / 3_600_000.0;
        let mut report = Self {
            peak_import_w: 0.0,
            peak_export_w: 0.0,
            steps_over_peak: 0,
            import_kwh: 0.0,
            export_kwh: 0.0,
            self_consumption_pct: 0.0,
            controlled_kwh: 0.0,
            commands,
            final_car_level: rows.last().and_then(|r| r.car_level),
        };

        let mut solar_kwh = 0.0;
        for row in rows {
            let s = &row.sample;
            report.peak_import_w = report.peak_import_w.max(s.import_w);
            report.peak_export_w = report.peak_export_w.max(s.export_w);
            if row.over_peak() {
                report.steps_over_peak += 1;
            }
            report.import_kwh += s.import_w * hours / 1000.0;
            report.export_kwh += s.export_w * hours / 1000.0;
            report.controlled_kwh += s.controlled_w * hours / 1000.0;
            solar_kwh += s.solar_w * hours / 1000.0;
        }

        if solar_kwh > 0.0 {
            report.self_consumption_pct =
                (100.0 * (solar_kwh - report.export_kwh) / solar_kwh).clamp(0.0, 100.0);
        }
        report
    }
}

impl fmt::Display for KpiReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- KPI Report ---")?;
        writeln!(f, "Peak import:           {:.0} W", self.peak_import_w)?;
        writeln!(f, "Peak export:           {:.0} W", self.peak_export_w)?;
        writeln!(f, "Steps over peak:       {}", self.steps_over_peak)?;
        writeln!(
            f,
            "Grid energy:           {:.2} kWh in, {:.2} kWh out",
            self.import_kwh, self.export_kwh
        )?;
        writeln!(f, "Solar self-use:        {:.1}%", self.self_consumption_pct)?;
        writeln!(f, "Controlled energy:     {:.2} kWh", self.controlled_kwh)?;
        writeln!(
            f,
            "Commands:              {} on, {} off, {} set-points",
            self.commands.switch_on, self.commands.switch_off, self.commands.set_points
        )?;
        match self.final_car_level {
            Some(level) => write!(f, "Car battery:           {level:.1}%"),
            None => write!(f, "Car battery:           n/a"),
        }
    }
}
