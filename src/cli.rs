//! Command-line options for the `peak-guard` simulator binary.

use std::env;
use std::path::PathBuf;

use crate::config::InstallationConfig;

/// Parsed command-line options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOptions {
    pub scenario: Option<PathBuf>,
    pub preset: Option<String>,
    pub seed: Option<u64>,
    pub telemetry_out: Option<PathBuf>,
    pub reports_out: Option<PathBuf>,
    /// Print one line per step.
    pub verbose: bool,
    pub help: bool,
}

/// Parses the process arguments.
///
/// # Errors
///
/// Returns a message describing the first invalid argument.
pub fn parse_args() -> Result<CliOptions, String> {
    parse_args_from(env::args().skip(1))
}

/// Parses `args` (without the program name).
///
/// # Errors
///
/// Returns a message describing the first invalid argument.
pub fn parse_args_from(args: impl IntoIterator<Item = String>) -> Result<CliOptions, String> {
    let mut args = args.into_iter();
    let mut opts = CliOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--scenario" => {
                let path = value(&mut args, "--scenario", "a TOML file path")?;
                if opts.scenario.replace(PathBuf::from(path)).is_some() {
                    return Err("--scenario provided more than once".to_string());
                }
            }
            "--preset" => {
                let name = value(&mut args, "--preset", "a preset name")?;
                if opts.preset.replace(name).is_some() {
                    return Err("--preset provided more than once".to_string());
                }
            }
            "--seed" => {
                let raw = value(&mut args, "--seed", "a u64")?;
                let seed = raw
                    .parse::<u64>()
                    .map_err(|_| format!("--seed value \"{raw}\" is not a valid u64"))?;
                opts.seed = Some(seed);
            }
            "--telemetry-out" => {
                let path = value(&mut args, "--telemetry-out", "a file path")?;
                opts.telemetry_out = Some(PathBuf::from(path));
            }
            "--reports-out" => {
                let path = value(&mut args, "--reports-out", "a file path")?;
                opts.reports_out = Some(PathBuf::from(path));
            }
            "--verbose" | "-v" => opts.verbose = true,
            "--help" | "-h" => opts.help = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    if opts.scenario.is_some() && opts.preset.is_some() {
        return Err(
            "arguments `--scenario` and `--preset` are mutually exclusive; choose one source"
                .to_string(),
        );
    }
    Ok(opts)
}

fn value(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
    expected: &str,
) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag} (expected {expected})"))
}

pub fn print_usage() {
    eprintln!("peak-guard: household peak-capacity load manager simulator");
    eprintln!();
    eprintln!("Usage: peak-guard [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>        Load installation from a TOML file");
    eprintln!(
        "  --preset <name>          Use a built-in preset ({})",
        InstallationConfig::PRESETS.join(", ")
    );
    eprintln!("  --seed <u64>             Override the simulation seed");
    eprintln!("  --telemetry-out <path>   Export step telemetry to CSV");
    eprintln!("  --reports-out <path>     Write state reports as JSON lines");
    eprintln!("  -v, --verbose            Print one line per step");
    eprintln!("  -h, --help               Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the solar_day preset is used.");
}

#[cfg(test)]
mod tests {
    use super::parse_args_from;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn supports_scenario_cli() {
        let opts =
            parse_args_from(args(&["--scenario", "home.toml"])).expect("parse should succeed");
        assert_eq!(opts.scenario.as_deref().and_then(|p| p.to_str()), Some("home.toml"));
        assert!(opts.preset.is_none());
    }

    #[test]
    fn supports_preset_seed_and_outputs() {
        let opts = parse_args_from(args(&[
            "--preset",
            "peak_stress",
            "--seed",
            "7",
            "--telemetry-out",
            "out.csv",
            "-v",
        ]))
        .expect("parse should succeed");
        assert_eq!(opts.preset.as_deref(), Some("peak_stress"));
        assert_eq!(opts.seed, Some(7));
        assert!(opts.telemetry_out.is_some());
        assert!(opts.verbose);
    }

    #[test]
    fn rejects_both_sources() {
        let err = parse_args_from(args(&["--scenario", "a.toml", "--preset", "solar_day"]));
        assert!(err.is_err_and(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn rejects_bad_seed_and_missing_value() {
        assert!(parse_args_from(args(&["--seed", "abc"])).is_err());
        assert!(parse_args_from(args(&["--preset"])).is_err());
        assert!(parse_args_from(args(&["--bogus"])).is_err());
    }
}
