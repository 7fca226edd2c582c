//! CSV export for simulation telemetry.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::household::TelemetryRow;

/// Column header for CSV telemetry export.
const HEADER: &str = "step,time,base_w,solar_w,controlled_w,battery_w,\
                      import_w,export_w,net_w,peak_w,over_peak,state,running,\
                      discharge_enabled,car_level";

/// Exports telemetry rows to a CSV file at the given path.
///
/// Produces deterministic output for identical inputs.
///
/// # Arguments
///
/// * `rows` - Complete simulation telemetry
/// * `path` - Output file path
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_csv(rows: &[TelemetryRow], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let buf = io::BufWriter::new(file);
    write_csv(rows, buf)
}

/// Writes telemetry rows as CSV to any writer.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_csv(rows: &[TelemetryRow], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);

    wtr.write_record(HEADER.split(',').map(str::trim))?;

    for r in rows {
        let s = &r.sample;
        wtr.write_record(&[
            r.step.to_string(),
            r.time.format("%Y-%m-%dT%H:%M:%S").to_string(),
            format!("{:.1}", s.base_w),
            format!("{:.1}", s.solar_w),
            format!("{:.1}", s.controlled_w),
            format!("{:.1}", s.battery_w),
            format!("{:.1}", s.import_w),
            format!("{:.1}", s.export_w),
            format!("{:.1}", s.net_w()),
            format!("{:.1}", r.peak_w),
            r.over_peak().to_string(),
            r.state.to_string(),
            r.running.clone(),
            r.discharge_enabled.to_string(),
            r.car_level.map(|l| format!("{l:.2}")).unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
