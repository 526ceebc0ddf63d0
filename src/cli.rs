use crate::config::BatchConfig;
use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use clap::{Parser, command};
use std::fs;
use std::path::PathBuf;

/// Downscale ERA-Interim runoff and route it with RAPID for every watershed
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// JSON batch configuration; flags given on the command line override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the RAPID executable
    #[arg(long)]
    rapid_executable: Option<PathBuf>,

    /// Root holding input/<WATERSHED>-<SUBBASIN> and output/
    #[arg(long)]
    rapid_io: Option<PathBuf>,

    /// Folder searched recursively for runoff .nc files
    #[arg(long)]
    runoff: Option<PathBuf>,

    /// Folder for timestamped log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Fetch the runoff archive before processing
    #[arg(long)]
    download: bool,

    /// Generate return period statistics after routing
    #[arg(long)]
    return_periods: bool,

    /// Upper bound on downscaling workers
    #[arg(short = 'j', long)]
    max_workers: Option<usize>,

    /// Per-file downscaling time limit in seconds
    #[arg(long)]
    job_timeout: Option<u64>,

    /// Keep converting remaining files after one fails
    #[arg(long)]
    keep_going: bool,

    /// Launch RAPID through this mpiexec
    #[arg(long)]
    mpiexec: Option<PathBuf>,

    /// Number of MPI processes for RAPID
    #[arg(long)]
    processes: Option<usize>,

    /// Simulation start, e.g. "1980-01-01 00:00:00"
    #[arg(long)]
    start: Option<String>,

    /// Hide the downscaling progress bar
    #[arg(long)]
    no_progress: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

fn load_config_file(path: &PathBuf) -> Result<BatchConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse config: {:?}", path))
}

fn required(value: Option<PathBuf>, flag: &str) -> Result<PathBuf> {
    match value {
        Some(v) => Ok(v),
        None => bail!("--{} is required when no --config is given", flag),
    }
}

impl Args {
    pub fn into_config(self) -> Result<BatchConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_file(path)?,
            None => BatchConfig::new(
                required(self.rapid_executable.clone(), "rapid-executable")?,
                required(self.rapid_io.clone(), "rapid-io")?,
                required(self.runoff.clone(), "runoff")?,
                required(self.log_dir.clone(), "log-dir")?,
            ),
        };

        if let Some(v) = self.rapid_executable {
            config.rapid_executable = v;
        }
        if let Some(v) = self.rapid_io {
            config.rapid_io_root = v;
        }
        if let Some(v) = self.runoff {
            config.runoff_root = v;
        }
        if let Some(v) = self.log_dir {
            config.log_root = v;
        }
        config.download_runoff |= self.download;
        config.generate_return_periods |= self.return_periods;
        if self.keep_going {
            config.cancel_on_failure = false;
        }
        if self.no_progress {
            config.show_progress = false;
        }
        if self.max_workers.is_some() {
            config.max_workers = self.max_workers;
        }
        if self.job_timeout.is_some() {
            config.job_timeout_secs = self.job_timeout;
        }
        if self.mpiexec.is_some() {
            config.mpiexec = self.mpiexec;
        }
        if let Some(n) = self.processes {
            config.routing_processes = n;
        }
        if let Some(start) = self.start {
            config.simulation_start = NaiveDateTime::parse_from_str(&start, "%Y-%m-%d %H:%M:%S")
                .with_context(|| format!("Failed to parse start time: {}", start))?;
        }
        Ok(config)
    }
}

pub fn get_args() -> Args {
    Args::parse()
}
