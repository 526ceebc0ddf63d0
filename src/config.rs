use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// Seconds in one routing/input step of the daily reanalysis product
pub const SECONDS_PER_DAY: u64 = 24 * 3600;
pub const ROUTING_SUBSTEP_SECONDS: u64 = 15 * 60;
pub const LOG_RETENTION_DAYS: i64 = 7;
pub const LOG_NAME_FORMAT: &str = "%y%m%d%H%M%S.log";
pub const RUNOFF_EXTENSION: &str = "nc";
pub const DEFAULT_PROJECT_NAME: &str = "ERA Interim Historical flows by US Army ERDC";

// Configuration for one batch run across every watershed under the I/O root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub rapid_executable: PathBuf,
    pub rapid_io_root: PathBuf,
    pub runoff_root: PathBuf,
    pub log_root: PathBuf,
    #[serde(default)]
    pub download_runoff: bool,
    #[serde(default)]
    pub generate_return_periods: bool,
    /// Upper bound on downscaling workers; the host CPU count is used when smaller.
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub cancel_on_failure: bool,
    #[serde(default)]
    pub mpiexec: Option<PathBuf>,
    #[serde(default = "default_routing_processes")]
    pub routing_processes: usize,
    #[serde(default = "default_simulation_start")]
    pub simulation_start: NaiveDateTime,
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_runoff_variables")]
    pub runoff_variables: Vec<String>,
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

impl BatchConfig {
    pub fn new(
        rapid_executable: PathBuf,
        rapid_io_root: PathBuf,
        runoff_root: PathBuf,
        log_root: PathBuf,
    ) -> Self {
        BatchConfig {
            rapid_executable,
            rapid_io_root,
            runoff_root,
            log_root,
            download_runoff: false,
            generate_return_periods: false,
            max_workers: None,
            job_timeout_secs: None,
            cancel_on_failure: true,
            mpiexec: None,
            routing_processes: default_routing_processes(),
            simulation_start: default_simulation_start(),
            project_name: default_project_name(),
            runoff_variables: default_runoff_variables(),
            show_progress: true,
        }
    }

    pub fn input_root(&self) -> PathBuf {
        self.rapid_io_root.join("input")
    }

    pub fn output_root(&self) -> PathBuf {
        self.rapid_io_root.join("output")
    }
}

fn default_true() -> bool {
    true
}

fn default_routing_processes() -> usize {
    num_cpus::get()
}

fn default_simulation_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

fn default_project_name() -> String {
    DEFAULT_PROJECT_NAME.to_string()
}

fn default_runoff_variables() -> Vec<String> {
    vec!["RO".to_string(), "ro".to_string()]
}

// Case-insensitive lookup patterns and output names for one watershed
#[derive(Debug, Clone)]
pub struct FilePatterns {
    pub weight_table: String,
    pub connectivity: String,
    pub riv_bas_id: String,
    pub k: String,
    pub x: String,
    pub comid_lat_lon_z: String,
    pub inflow_output: String,
    pub qout_output: String,
    pub qout_raw_output: String,
    pub return_periods_output: String,
    pub namelist: String,
}

impl FilePatterns {
    pub fn new() -> Self {
        FilePatterns {
            weight_table: r"weight_era_interim\.csv".to_string(),
            connectivity: r"rapid_connect\.csv".to_string(),
            riv_bas_id: r"riv_bas_id\.csv".to_string(),
            k: r"^k\.csv$".to_string(),
            x: r"^x\.csv$".to_string(),
            comid_lat_lon_z: r"comid_lat_lon_z\.csv".to_string(),
            inflow_output: "m3_riv_bas_erai.nc".to_string(),
            qout_output: "Qout_erai.nc".to_string(),
            qout_raw_output: "Qout_erai_raw.nc".to_string(),
            return_periods_output: "return_periods.nc".to_string(),
            namelist: "rapid_namelist".to_string(),
        }
    }
}

/// Routing constants shared read-only by every watershed in a batch.
///
/// Field names follow the routing model's namelist keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingParameters {
    /// Duration of one routing procedure (time step of the runoff data).
    pub zs_tau_r: u64,
    /// Internal routing time step.
    pub zs_dt_r: u64,
    /// Total simulation time.
    pub zs_tau_m: u64,
    /// Input time step.
    pub zs_dt_m: u64,
}

impl RoutingParameters {
    pub fn from_inventory(runoff_file_count: usize) -> Self {
        RoutingParameters {
            zs_tau_r: SECONDS_PER_DAY,
            zs_dt_r: ROUTING_SUBSTEP_SECONDS,
            zs_tau_m: runoff_file_count as u64 * SECONDS_PER_DAY,
            zs_dt_m: SECONDS_PER_DAY,
        }
    }

    pub fn output_steps(&self) -> usize {
        (self.zs_tau_m / self.zs_tau_r) as usize
    }
}
