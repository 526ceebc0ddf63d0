use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure of a single downscaling job, kept so the watershed can report
/// every broken time slice instead of just the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub time_index: usize,
    pub runoff_file: PathBuf,
    pub reason: JobFailureReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobFailureReason {
    Conversion(String),
    ShapeMismatch { expected: usize, actual: usize },
    TimedOut { elapsed_secs: f64, limit_secs: u64 },
    Cancelled,
}

impl fmt::Display for JobFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailureReason::Conversion(msg) => write!(f, "conversion failed: {}", msg),
            JobFailureReason::ShapeMismatch { expected, actual } => write!(
                f,
                "converter returned {} values, weight table has {} reaches",
                actual, expected
            ),
            JobFailureReason::TimedOut {
                elapsed_secs,
                limit_secs,
            } => write!(f, "took {:.1}s, limit is {}s", elapsed_secs, limit_secs),
            JobFailureReason::Cancelled => write!(f, "cancelled after a sibling job failed"),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "time index {} ({}): {}",
            self.time_index,
            self.runoff_file.display(),
            self.reason
        )
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input root {} does not exist or is not a directory", .0.display())]
    MissingInputRoot(PathBuf),

    #[error("no runoff files with extension .{extension} found under {}", .root.display())]
    EmptyInventory { root: PathBuf, extension: String },

    #[error(
        "runoff files are not in chronological order: {} sorts before {}",
        .previous.display(),
        .next.display()
    )]
    NonMonotonicInventory { previous: PathBuf, next: PathBuf },

    #[error("no file matching '{pattern}' in {}", .directory.display())]
    MissingRequiredFile { directory: PathBuf, pattern: String },

    #[error("pattern '{pattern}' is ambiguous in {}: {candidates:?}", .directory.display())]
    AmbiguousMatch {
        directory: PathBuf,
        pattern: String,
        candidates: Vec<String>,
    },

    #[error("invalid weight table {}: {reason}", .path.display())]
    InvalidWeightTable { path: PathBuf, reason: String },

    #[error("{} of {} downscaling jobs failed; first: {}", .failures.len(), .total, first_cause(.failures))]
    Conversion {
        total: usize,
        failures: Vec<JobFailure>,
    },

    #[error("routing model failed: {0}")]
    RoutingInvocation(String),

    #[error("CF normalization failed: {0}")]
    Normalization(String),

    #[error("return period generation failed: {0}")]
    Statistics(String),

    #[error("invalid river network {}: {reason}", .path.display())]
    InvalidNetwork { path: PathBuf, reason: String },

    #[error("could not start downscaling pool: {0}")]
    PoolBuild(String),

    #[error("downscaling pool has been shut down")]
    PoolShutDown,

    #[error("runoff download requested but no archive fetcher is configured")]
    DownloadUnavailable,

    #[error("runoff download failed: {0}")]
    Download(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid netCDF file {}: {reason}", .path.display())]
    InvalidNetCdf { path: PathBuf, reason: String },

    #[error("netCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

// Cancelled jobs only echo an earlier failure, so report a real cause first
fn first_cause(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .find(|f| f.reason != JobFailureReason::Cancelled)
        .or_else(|| failures.first())
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none recorded".to_string())
}
