//! peak-guard entry point: CLI wiring and a simulated day on virtual time.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process;

use peak_guard::cli::{self, CliOptions};
use peak_guard::config::InstallationConfig;
use peak_guard::household::run_simulation;
use peak_guard::io::export::export_csv;
use peak_guard::report::{JsonLinesSink, ReportSink};
use tracing_subscriber::EnvFilter;

fn load_config(opts: &CliOptions) -> InstallationConfig {
    let loaded = if let Some(path) = &opts.scenario {
        InstallationConfig::from_toml_file(path)
    } else if let Some(name) = &opts.preset {
        InstallationConfig::from_preset(name)
    } else {
        Ok(InstallationConfig::solar_day())
    };
    match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    }
}

fn write_reports(path: &Path, reports: &[peak_guard::report::StateReport]) -> Result<(), String> {
    let file = File::create(path).map_err(|e| e.to_string())?;
    let mut sink = JsonLinesSink::new(BufWriter::new(file));
    for report in reports {
        sink.publish(report).map_err(|e| e.to_string())?;
    }
    sink.into_inner().flush().map_err(|e| e.to_string())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = match cli::parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error: {e}");
            cli::print_usage();
            process::exit(1);
        }
    };
    if opts.help {
        cli::print_usage();
        return;
    }

    let mut config = load_config(&opts);
    if let Some(seed) = opts.seed {
        config.simulation.seed = seed;
    }

    let result = match run_simulation(&config) {
        Ok(result) => result,
        Err(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            process::exit(1);
        }
    };

    if opts.verbose {
        for row in &result.telemetry {
            let s = &row.sample;
            println!(
                "{} import={:>6.0} export={:>6.0} solar={:>6.0} ctl={:>6.0} peak={:.0} {} [{}]",
                row.time.format("%H:%M"),
                s.import_w,
                s.export_w,
                s.solar_w,
                s.controlled_w,
                row.peak_w,
                row.state,
                row.running
            );
        }
    }

    println!("\n{}", result.kpis);

    if let Some(path) = &opts.telemetry_out {
        if let Err(e) = export_csv(&result.telemetry, path) {
            eprintln!("error: failed to write CSV: {e}");
            process::exit(1);
        }
        eprintln!("Telemetry written to {}", path.display());
    }

    if let Some(path) = &opts.reports_out {
        if let Err(e) = write_reports(path, &result.reports) {
            eprintln!("error: failed to write reports: {e}");
            process::exit(1);
        }
        eprintln!("{} state reports written to {}", result.reports.len(), path.display());
    }
}
