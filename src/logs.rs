use crate::config::{LOG_NAME_FORMAT, LOG_RETENTION_DAYS};
use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A file in the log directory whose name is not a log timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogParseFailure {
    pub name: String,
    pub reason: String,
}

impl fmt::Display for LogParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub skipped: Vec<LogParseFailure>,
}

pub fn log_file_name(at: DateTime<Utc>) -> String {
    at.format(LOG_NAME_FORMAT).to_string()
}

/// Removes logs older than the retention window. Names that do not parse
/// and files that cannot be removed are recorded and skipped.
pub fn clean_logs(
    log_dir: &Path,
    now: DateTime<Utc>,
    retention: Duration,
) -> PipelineResult<RetentionReport> {
    let mut report = RetentionReport::default();
    let entries = fs::read_dir(log_dir).map_err(|e| PipelineError::io(log_dir, e))?;

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let stamp = match NaiveDateTime::parse_from_str(&name, LOG_NAME_FORMAT) {
            Ok(stamp) => stamp.and_utc(),
            Err(e) => {
                warn!("skipping {} in {}: not a log file name ({})", name, log_dir.display(), e);
                report.skipped.push(LogParseFailure {
                    name,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if now - stamp > retention {
            match fs::remove_file(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) => {
                    warn!("could not remove old log {}: {}", path.display(), e);
                    report.skipped.push(LogParseFailure {
                        name,
                        reason: format!("could not remove: {}", e),
                    })
                }
            }
        } else {
            report.kept += 1;
        }
    }

    info!(
        "Log cleanup in {}: removed {}, kept {}, skipped {}",
        log_dir.display(),
        report.removed.len(),
        report.kept,
        report.skipped.len()
    );
    Ok(report)
}

pub fn default_retention() -> Duration {
    Duration::days(LOG_RETENTION_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn removes_only_aged_logs() {
        let temp = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let old = log_file_name(now - Duration::days(8));
        let recent = log_file_name(now - Duration::days(3));
        fs::write(temp.path().join(&old), "").unwrap();
        fs::write(temp.path().join(&recent), "").unwrap();
        fs::write(temp.path().join("notes.txt"), "").unwrap();
        fs::create_dir(temp.path().join("240101000000.log")).unwrap();

        let report = clean_logs(temp.path(), now, default_retention()).unwrap();

        assert!(!temp.path().join(&old).exists());
        assert!(temp.path().join(&recent).exists());
        assert!(temp.path().join("notes.txt").exists());
        assert!(temp.path().join("240101000000.log").is_dir());
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.kept, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].name, "notes.txt");
    }

    #[test]
    fn log_names_use_two_digit_year() {
        let at = Utc.with_ymd_and_hms(2016, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(log_file_name(at), "160102030405.log");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(clean_logs(&temp.path().join("nope"), Utc::now(), default_retention()).is_err());
    }
}
