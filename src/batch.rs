use crate::catalog::{Rejection, discover_watersheds};
use crate::config::{BatchConfig, FilePatterns, RUNOFF_EXTENSION, RoutingParameters};
use crate::convert::{InflowConverter, NetCdfRunoffConverter};
use crate::error::{PipelineError, PipelineResult};
use crate::inventory::{RunoffInventory, TimeKey, date_from_file_name};
use crate::logs::{RetentionReport, clean_logs, default_retention};
use crate::pipeline::{BatchContext, WatershedOutcome, run_watershed};
use crate::routing::{CfConverter, CfNormalizer, RapidExecutable, RoutingModel};
use crate::stats::{GumbelReturnPeriods, ReturnPeriodGenerator};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Retrieves source runoff archives and returns the folder to read them from.
pub trait ArchiveFetcher: Send + Sync {
    fn fetch(&self, destination: &Path) -> Result<PathBuf>;
}

/// External pieces the batch calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub converter: Arc<dyn InflowConverter>,
    pub routing: Arc<dyn RoutingModel>,
    pub normalizer: Arc<dyn CfNormalizer>,
    pub statistics: Arc<dyn ReturnPeriodGenerator>,
    pub fetcher: Option<Arc<dyn ArchiveFetcher>>,
    pub time_key: TimeKey,
}

impl Collaborators {
    pub fn from_config(config: &BatchConfig, patterns: &FilePatterns) -> Self {
        Collaborators {
            converter: Arc::new(NetCdfRunoffConverter::new(config.runoff_variables.clone())),
            routing: Arc::new(RapidExecutable {
                executable: config.rapid_executable.clone(),
                mpiexec: config.mpiexec.clone(),
                processes: config.routing_processes,
                namelist_name: patterns.namelist.clone(),
            }),
            normalizer: Arc::new(CfConverter),
            statistics: Arc::new(GumbelReturnPeriods),
            fetcher: None,
            time_key: date_from_file_name,
        }
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub runoff_files: usize,
    pub params: RoutingParameters,
    pub rejected: Vec<Rejection>,
    pub outcomes: Vec<WatershedOutcome>,
    /// `None` when the log folder was missing or could not be read.
    pub log_cleanup: Option<RetentionReport>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &WatershedOutcome> {
        self.outcomes.iter().filter(|o| !o.terminal.is_done())
    }

    pub fn all_done(&self) -> bool {
        self.failed().next().is_none()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Watersheds:")?;
        for outcome in &self.outcomes {
            write!(
                f,
                "  {:<24} {} ({:.2?})",
                outcome.watershed.directory_name, outcome.terminal, outcome.elapsed
            )?;
            if let Some(e) = &outcome.statistics_error {
                write!(f, " [return periods: {}]", e)?;
            }
            writeln!(f)?;
        }
        for rejected in &self.rejected {
            writeln!(f, "  {:<24} skipped: {}", rejected.name, rejected.reason)?;
        }
        if let Some(cleanup) = &self.log_cleanup {
            writeln!(
                f,
                "Logs: removed {}, kept {}",
                cleanup.removed.len(),
                cleanup.kept
            )?;
            for skipped in &cleanup.skipped {
                writeln!(f, "  log entry skipped: {}", skipped)?;
            }
        }
        writeln!(f, "Time Begin All: {}", self.begin)?;
        writeln!(f, "Time Finish All: {}", self.end)?;
        write!(f, "TOTAL TIME: {}", self.end - self.begin)
    }
}

/// Runs every watershed under the I/O root. Only batch-level setup errors
/// (missing input root, no runoff data, unusable download) are returned;
/// watershed failures are recorded in the report.
pub fn run_batch(
    config: &BatchConfig,
    collaborators: &Collaborators,
    now: DateTime<Utc>,
) -> PipelineResult<BatchReport> {
    let begin = Utc::now();
    let patterns = FilePatterns::new();

    let log_cleanup = if config.log_root.is_dir() {
        match clean_logs(&config.log_root, now, default_retention()) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("log cleanup failed: {}", e);
                None
            }
        }
    } else {
        None
    };

    let catalog = discover_watersheds(&config.input_root(), &config.output_root())?;

    let runoff_folder = if config.download_runoff {
        let fetcher = collaborators
            .fetcher
            .as_ref()
            .ok_or(PipelineError::DownloadUnavailable)?;
        fetcher
            .fetch(&config.runoff_root)
            .map_err(|e| PipelineError::Download(format!("{:#}", e)))?
    } else {
        config.runoff_root.clone()
    };

    let inventory = RunoffInventory::collect(&runoff_folder, RUNOFF_EXTENSION)?;
    inventory.validate_chronology(collaborators.time_key)?;
    let params = RoutingParameters::from_inventory(inventory.len());
    info!(
        "Routing {} days: ZS_TauM={} ZS_TauR={} ZS_dtR={}",
        inventory.len(),
        params.zs_tau_m,
        params.zs_tau_r,
        params.zs_dt_r
    );

    let ctx = BatchContext {
        config,
        patterns: &patterns,
        inventory: &inventory,
        params,
        collaborators,
    };
    let outcomes: Vec<_> = catalog
        .watersheds
        .iter()
        .map(|watershed| run_watershed(watershed, &ctx))
        .collect();

    let report = BatchReport {
        begin,
        end: Utc::now(),
        runoff_files: inventory.len(),
        params,
        rejected: catalog.rejected,
        outcomes,
        log_cleanup,
    };
    info!(
        "{} watersheds done, {} failed",
        report.outcomes.len() - report.failed().count(),
        report.failed().count()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::InflowAccumulator;
    use crate::routing::{NormalizeRequest, RoutingRequest};
    use crate::state::{Stage, Terminal};
    use crate::stats::StatisticsRequest;
    use crate::weight_table::WeightTable;
    use anyhow::bail;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScalarConverter;

    impl InflowConverter for ScalarConverter {
        fn convert(&self, runoff_file: &Path, weights: &WeightTable) -> Result<Vec<f32>> {
            let value: f32 = fs::read_to_string(runoff_file)?.trim().parse()?;
            Ok(weights
                .reach_ids()
                .iter()
                .map(|id| value * (*id % 100) as f32)
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingRouter {
        requests: Mutex<Vec<RoutingRequest>>,
    }

    impl RoutingModel for RecordingRouter {
        fn run(&self, request: &RoutingRequest) -> Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            fs::write(&request.qout_file, "raw")?;
            Ok(())
        }
    }

    struct CopyNormalizer;

    impl CfNormalizer for CopyNormalizer {
        fn normalize(&self, request: &NormalizeRequest) -> Result<()> {
            fs::rename(&request.raw_qout, &request.output)?;
            Ok(())
        }
    }

    struct BrokenStatistics;

    impl ReturnPeriodGenerator for BrokenStatistics {
        fn generate(&self, _: &StatisticsRequest) -> Result<()> {
            bail!("not enough years of record")
        }
    }

    struct TouchStatistics;

    impl ReturnPeriodGenerator for TouchStatistics {
        fn generate(&self, request: &StatisticsRequest) -> Result<()> {
            fs::write(&request.output, "stats")?;
            Ok(())
        }
    }

    fn write_watershed(input: &Path, name: &str, with_k: bool) {
        let dir = input.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("Weight_ERA_Interim.csv"),
            "rivid,area_sqm,lon_index,lat_index,npoints\n\
             101,10,0,0,1\n102,10,0,1,1\n103,10,1,0,1\n104,10,1,1,1\n105,10,2,2,1\n",
        )
        .unwrap();
        fs::write(
            dir.join("rapid_connect.csv"),
            "101,103,0,0,0\n102,103,0,0,0\n103,105,2,101,102\n104,105,0,0,0\n105,0,2,103,104\n",
        )
        .unwrap();
        fs::write(dir.join("riv_bas_id.csv"), "101\n102\n103\n104\n105\n").unwrap();
        if with_k {
            fs::write(dir.join("k.csv"), "3600\n3600\n3600\n3600\n3600\n").unwrap();
        }
        fs::write(dir.join("x.csv"), "0.3\n0.3\n0.3\n0.3\n0.3\n").unwrap();
        fs::write(
            dir.join("comid_lat_lon_z.csv"),
            "COMID,Lat,Lon,Elev_m\n101,-22,17,0\n",
        )
        .unwrap();
    }

    struct Scenario {
        temp: TempDir,
        config: BatchConfig,
        router: Arc<RecordingRouter>,
    }

    fn scenario(statistics: Arc<dyn ReturnPeriodGenerator>) -> (Scenario, Collaborators) {
        let temp = TempDir::new().unwrap();
        let io_root = temp.path().join("rapid-io");
        let runoff = temp.path().join("era_interim");
        let logs = temp.path().join("logs");
        fs::create_dir_all(&runoff).unwrap();
        fs::create_dir_all(&logs).unwrap();
        for (day, value) in ["1.0", "2.0", "3.0"].iter().enumerate() {
            fs::write(runoff.join(format!("Runoff.1980010{}.nc", day + 1)), value).unwrap();
        }
        write_watershed(&io_root.join("input"), "NAMIBIA-1", true);
        fs::create_dir_all(io_root.join("input").join("misnamed")).unwrap();

        let mut config = BatchConfig::new(
            PathBuf::from("/unused/rapid"),
            io_root,
            runoff,
            logs,
        );
        config.generate_return_periods = true;
        config.show_progress = false;
        config.max_workers = Some(2);

        let router = Arc::new(RecordingRouter::default());
        let collaborators = Collaborators {
            converter: Arc::new(ScalarConverter),
            routing: router.clone(),
            normalizer: Arc::new(CopyNormalizer),
            statistics,
            fetcher: None,
            time_key: date_from_file_name,
        };
        (
            Scenario {
                temp,
                config,
                router,
            },
            collaborators,
        )
    }

    #[test]
    fn namibia_end_to_end() {
        let (sc, collaborators) = scenario(Arc::new(TouchStatistics));
        let report = run_batch(&sc.config, &collaborators, Utc::now()).unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.terminal, Terminal::Done);
        assert_eq!(outcome.watershed.watershed, "namibia");
        assert_eq!(outcome.stages.last(), Some(&Stage::Done));
        assert!(outcome.stages.contains(&Stage::StatisticsGenerated));

        let output_dir = sc.config.output_root().join("NAMIBIA-1");
        let acc = InflowAccumulator::open(&output_dir.join("m3_riv_bas_erai.nc")).unwrap();
        assert_eq!(acc.time_len(), 4);
        assert_eq!(acc.reach_count(), 5);
        assert_eq!(acc.read_row(0).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(acc.read_row(1).unwrap(), vec![2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(acc.read_row(2).unwrap(), vec![3.0, 6.0, 9.0, 12.0, 15.0]);
        assert_eq!(acc.read_row(3).unwrap(), vec![0.0; 5]);

        let requests = sc.router.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].params.zs_tau_m, 3 * 86400);
        assert_eq!(requests[0].reach_counts.riv_tot, 5);
        assert_eq!(requests[0].reach_counts.max_up, 2);
        assert_eq!(requests[0].working_dir, output_dir);

        assert!(output_dir.join("Qout_erai.nc").exists());
        assert!(output_dir.join("return_periods.nc").exists());
        assert!(report.all_done());
        assert!(sc.temp.path().exists());
    }

    #[test]
    fn failing_watershed_does_not_stop_siblings() {
        let (sc, collaborators) = scenario(Arc::new(TouchStatistics));
        write_watershed(&sc.config.input_root(), "congo-2", false);

        let report = run_batch(&sc.config, &collaborators, Utc::now()).unwrap();

        assert_eq!(report.outcomes.len(), 2);
        let outcome = |name: &str| {
            report
                .outcomes
                .iter()
                .find(|o| o.watershed.directory_name == name)
                .unwrap()
        };
        let congo = outcome("congo-2");
        match &congo.terminal {
            Terminal::Failed { stage, reason } => {
                assert_eq!(*stage, Stage::Routed);
                assert!(reason.contains("k\\.csv"), "{}", reason);
            }
            other => panic!("expected failure, got {}", other),
        }
        assert_eq!(outcome("NAMIBIA-1").terminal, Terminal::Done);
        assert_eq!(sc.router.requests.lock().unwrap().len(), 1);
        assert!(!report.all_done());
    }

    #[test]
    fn statistics_failure_is_reported_not_fatal() {
        let (sc, collaborators) = scenario(Arc::new(BrokenStatistics));
        let report = run_batch(&sc.config, &collaborators, Utc::now()).unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.terminal, Terminal::Done);
        assert!(outcome.stages.contains(&Stage::StatisticsSkipped));
        assert!(outcome
            .statistics_error
            .as_deref()
            .is_some_and(|e| e.contains("not enough years")));
        assert!(outcome.outputs.discharge.is_some());
        assert!(outcome.outputs.return_periods.is_none());
    }

    #[test]
    fn conversion_failure_fails_only_that_watershed() {
        let (mut sc, collaborators) = scenario(Arc::new(TouchStatistics));
        sc.config.cancel_on_failure = false;
        fs::write(sc.config.runoff_root.join("Runoff.19800102.nc"), "garbage").unwrap();

        let report = run_batch(&sc.config, &collaborators, Utc::now()).unwrap();
        match &report.outcomes[0].terminal {
            Terminal::Failed { stage, reason } => {
                assert_eq!(*stage, Stage::Downscaled);
                assert!(reason.contains("1 of 3"), "{}", reason);
            }
            other => panic!("expected failure, got {}", other),
        }
        assert!(sc.router.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_inventory_aborts_the_batch() {
        let (sc, collaborators) = scenario(Arc::new(TouchStatistics));
        for entry in fs::read_dir(&sc.config.runoff_root).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        let err = run_batch(&sc.config, &collaborators, Utc::now()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInventory { .. }));
    }

    #[test]
    fn download_without_fetcher_is_refused() {
        let (mut sc, collaborators) = scenario(Arc::new(TouchStatistics));
        sc.config.download_runoff = true;
        let err = run_batch(&sc.config, &collaborators, Utc::now()).unwrap_err();
        assert!(matches!(err, PipelineError::DownloadUnavailable));
    }

    #[test]
    fn report_lists_every_watershed() {
        let (sc, collaborators) = scenario(Arc::new(TouchStatistics));
        let report = run_batch(&sc.config, &collaborators, Utc::now()).unwrap();
        let text = report.to_string();
        assert!(text.contains("NAMIBIA-1"));
        assert!(text.contains("Done"));
        assert!(text.contains("misnamed"));
        assert!(text.contains("TOTAL TIME"));
    }

    #[test]
    fn unparsable_log_names_are_reported() {
        let (sc, collaborators) = scenario(Arc::new(TouchStatistics));
        fs::write(sc.config.log_root.join("notes.txt"), "").unwrap();

        let report = run_batch(&sc.config, &collaborators, Utc::now()).unwrap();
        let cleanup = report.log_cleanup.as_ref().unwrap();
        assert_eq!(cleanup.skipped.len(), 1);
        assert_eq!(cleanup.skipped[0].name, "notes.txt");
        assert!(report.to_string().contains("log entry skipped: notes.txt"));
        assert!(sc.config.log_root.join("notes.txt").exists());
    }

    struct PanickingNormalizer;

    impl CfNormalizer for PanickingNormalizer {
        fn normalize(&self, _: &NormalizeRequest) -> Result<()> {
            panic!("index out of bounds")
        }
    }

    #[test]
    fn panicking_collaborator_fails_only_its_watershed() {
        let (sc, mut collaborators) = scenario(Arc::new(TouchStatistics));
        collaborators.normalizer = Arc::new(PanickingNormalizer);

        let report = run_batch(&sc.config, &collaborators, Utc::now()).unwrap();
        match &report.outcomes[0].terminal {
            Terminal::Failed { stage, reason } => {
                assert_eq!(*stage, Stage::Normalized);
                assert!(reason.contains("index out of bounds"), "{}", reason);
            }
            other => panic!("expected failure, got {}", other),
        }
    }
}
