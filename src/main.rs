use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use filequeue_run::calibrator::{CalibrationStrategy, NoopCalibrator, ProbeCalibrator};
use filequeue_run::config::{self, ConfigOverrides};
use filequeue_run::manifest;
use filequeue_run::work_loop;

/// Drive a file manifest through an external binary under resource ceilings.
#[derive(Parser, Debug)]
#[command(name = "filequeue-run", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Path to the file containing the list of input files, one per line.
    #[arg(long = "input-file-list")]
    input_file_list: PathBuf,

    /// Output directory; created if it does not already exist.
    #[arg(long = "output-dir")]
    output_dir: PathBuf,

    /// Tracing filter directive, e.g. "info" or "filequeue_run=debug".
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Override the configured CPU ceiling.
    #[arg(long = "max-cpu-percent")]
    max_cpu_percent: Option<f64>,

    /// Override the configured memory ceiling.
    #[arg(long = "max-memory-percent")]
    max_memory_percent: Option<f64>,

    /// Override the configured concurrency cap.
    #[arg(long = "max-processes")]
    max_processes: Option<usize>,

    /// Run a one-shot calibration probe before starting the manifest.
    #[arg(long = "calibrate", default_value_t = false)]
    calibrate: bool,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn validate_paths(cli: &Cli) -> Result<()> {
    if !cli.config.is_file() {
        anyhow::bail!("config file not found: {}", cli.config.display());
    }
    if !cli.input_file_list.is_file() {
        anyhow::bail!(
            "input file list not found: {}",
            cli.input_file_list.display()
        );
    }
    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("create output dir {}", cli.output_dir.display()))?;
    Ok(())
}

fn run(cli: Cli) -> Result<i32> {
    validate_paths(&cli)?;

    let job_spec = config::load(
        &cli.config,
        ConfigOverrides {
            max_cpu_percent: cli.max_cpu_percent,
            max_memory_percent: cli.max_memory_percent,
            max_processes: cli.max_processes,
            output_dir: Some(cli.output_dir.clone()),
        },
    )?;

    let entries = manifest::read(&cli.input_file_list)?;
    config::validate_against_manifest(&job_spec, &entries)?;

    let calibrator: Box<dyn CalibrationStrategy> = if cli.calibrate {
        Box::new(ProbeCalibrator)
    } else {
        Box::new(NoopCalibrator)
    };

    work_loop::run(&job_spec, entries, calibrator.as_ref())
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    work_loop::install_sigint_handler();

    match run(cli) {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            std::process::ExitCode::from(1)
        }
    }
}
