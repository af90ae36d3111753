//! Command-line runner for compiled canister artifacts.

mod telemetry;

use anyhow::{Context, Result};
use canister_core::{parse_hex, EmulatorConfig};
use canister_runner::Driver;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Load a canister WASM module and call its init and query entry points
/// against an emulated ic0 system API.
#[derive(Debug, Parser)]
#[command(name = "canister-runner", version, about, long_about = None)]
struct Cli {
    /// Path to the compiled canister (.wasm or .wat).
    #[arg(value_name = "WASM")]
    path: PathBuf,

    /// JSON configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Argument bytes for every call, as hex.
    #[arg(long, value_name = "HEX")]
    arg_hex: Option<String>,

    /// Caller principal bytes, as hex.
    #[arg(long, value_name = "HEX")]
    caller_hex: Option<String>,

    /// Emit the run report as JSON instead of human-readable text.
    #[arg(long)]
    json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_telemetry(cli.verbose) {
        eprintln!("failed to initialise logging: {}", e);
    }

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            if cli.json {
                println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<EmulatorConfig> {
    let mut config = match &cli.config {
        Some(path) => EmulatorConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EmulatorConfig::default(),
    };

    if let Some(hex) = &cli.arg_hex {
        config.argument_bytes = parse_hex(hex).context("--arg-hex")?;
    }
    if let Some(hex) = &cli.caller_hex {
        config.caller_id = parse_hex(hex).context("--caller-hex")?;
    }

    Ok(config)
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = load_config(cli)?;
    let mut driver = Driver::new(config)?;
    let report = driver.run(&cli.path)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }

    info!(
        "{} invocations, {} failed",
        report.invocations.len(),
        report.failures()
    );
    Ok(ExitCode::from(report.exit_code()))
}
