use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod accumulator;
mod batch;
mod catalog;
mod cli;
mod config;
mod convert;
mod downscale;
mod error;
mod inventory;
mod io;
mod locate;
mod logs;
mod network;
mod pipeline;
mod routing;
mod state;
mod stats;
mod weight_table;

use batch::{Collaborators, run_batch};
use cli::get_args;
use config::{BatchConfig, FilePatterns};
use logs::log_file_name;

fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

// Logs go to stdout and to a timestamped file in the log folder
fn init_logging(config: &BatchConfig, level: Level) -> Result<()> {
    fs::create_dir_all(&config.log_root)
        .with_context(|| format!("Failed to create log folder: {:?}", config.log_root))?;
    let log_path = config.log_root.join(log_file_name(Utc::now()));
    let log_file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file: {:?}", log_path))?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stdout.and(Mutex::new(log_file)))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    info!("Logging to {}", log_path.display());
    Ok(())
}

fn main() -> Result<ExitCode> {
    // Configuration
    let args = get_args();
    let level = parse_level(&args.log_level);
    let config = args.into_config()?;
    init_logging(&config, level)?;

    let collaborators = Collaborators::from_config(&config, &FilePatterns::new());
    let report = run_batch(&config, &collaborators, Utc::now())?;

    println!("\n{}", report);
    if report.all_done() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
