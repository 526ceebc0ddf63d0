use crate::accumulator::InflowAccumulator;
use crate::catalog::Watershed;
use crate::config::BatchConfig;
use crate::convert::InflowConverter;
use crate::error::{JobFailure, JobFailureReason, PipelineError, PipelineResult};
use crate::inventory::RunoffInventory;
use crate::weight_table::WeightTable;
use indicatif::ProgressBar;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One unit of parallel work: one runoff file into one accumulator row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub watershed: String,
    pub subbasin: String,
    pub runoff_file: PathBuf,
    pub time_index: usize,
    pub weight_table: PathBuf,
    pub accumulator: PathBuf,
}

/// One job per runoff file; the time index is the file's position in the
/// sorted inventory, so indices are exactly `0..N`.
pub fn build_jobs(
    watershed: &Watershed,
    inventory: &RunoffInventory,
    weights: &WeightTable,
    accumulator: &InflowAccumulator,
) -> Vec<JobDescriptor> {
    inventory
        .files()
        .iter()
        .enumerate()
        .map(|(time_index, runoff_file)| JobDescriptor {
            watershed: watershed.watershed.clone(),
            subbasin: watershed.subbasin.clone(),
            runoff_file: runoff_file.clone(),
            time_index,
            weight_table: weights.path().to_path_buf(),
            accumulator: accumulator.path().to_path_buf(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_workers: Option<usize>,
    /// Jobs running longer are discarded and counted as failures once they return.
    pub job_timeout: Option<Duration>,
    /// Skip jobs that have not started once any job has failed.
    pub cancel_on_failure: bool,
}

impl PoolOptions {
    pub fn from_config(config: &BatchConfig) -> Self {
        PoolOptions {
            max_workers: config.max_workers,
            job_timeout: config.job_timeout_secs.map(Duration::from_secs),
            cancel_on_failure: config.cancel_on_failure,
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_workers: None,
            job_timeout: None,
            cancel_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownscaleReport {
    pub completed: usize,
    pub elapsed: Duration,
}

/// Fixed-size worker pool for one watershed's downscaling phase.
///
/// Created before the phase, joined by [`DownscalePool::run_all`], and torn
/// down with [`DownscalePool::shutdown`]; submissions after shutdown are
/// rejected.
pub struct DownscalePool {
    pool: Option<ThreadPool>,
    workers: usize,
    options: PoolOptions,
}

impl DownscalePool {
    pub fn new(options: PoolOptions) -> PipelineResult<Self> {
        let available = num_cpus::get();
        let workers = options
            .max_workers
            .map_or(available, |max| max.min(available))
            .max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("downscale-{}", i))
            .build()
            .map_err(|e| PipelineError::PoolBuild(e.to_string()))?;
        debug!("downscaling pool started with {} workers", workers);
        Ok(DownscalePool {
            pool: Some(pool),
            workers,
            options,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.is_none()
    }

    pub fn shutdown(&mut self) {
        if self.pool.take().is_some() {
            debug!("downscaling pool shut down");
        }
    }

    /// Runs every job and blocks until all of them have finished. Workers
    /// send finished rows through a bounded channel to the calling thread,
    /// the only writer of the accumulator file, so at most a few rows are in
    /// memory at once. Failures are collected, not raised one by one; any
    /// failure fails the whole call.
    pub fn run_all(
        &self,
        jobs: &[JobDescriptor],
        weights: &WeightTable,
        converter: &dyn InflowConverter,
        accumulator: &InflowAccumulator,
        progress: &ProgressBar,
    ) -> PipelineResult<DownscaleReport> {
        let pool = self.pool.as_ref().ok_or(PipelineError::PoolShutDown)?;
        let started = Instant::now();
        let total = jobs.len();

        let unassigned = unassigned_jobs(jobs, accumulator);
        if !unassigned.is_empty() {
            return Err(PipelineError::Conversion {
                total,
                failures: unassigned,
            });
        }

        let mut writer = accumulator.writer()?;
        let reach_count = accumulator.reach_count();
        let cancelled = AtomicBool::new(false);
        let (sender, receiver) = mpsc::sync_channel::<(usize, Vec<f32>)>(self.workers * 2);

        let (mut failures, write_error) = thread::scope(|scope| {
            let cancelled = &cancelled;
            let workers = scope.spawn(move || {
                let sender = sender;
                pool.install(|| {
                    jobs.par_iter()
                        .filter_map(|job| {
                            self.run_job(job, reach_count, weights, converter, &sender, cancelled, progress)
                        })
                        .collect::<Vec<_>>()
                })
            });

            let mut write_error = None;
            // Keep draining after a write error so no worker stays blocked
            for (time_index, row) in receiver.iter() {
                if write_error.is_some() {
                    continue;
                }
                if let Err(e) = writer.write_row(time_index, &row) {
                    cancelled.store(true, Ordering::Relaxed);
                    write_error = Some(e);
                }
            }
            match workers.join() {
                Ok(failures) => (failures, write_error),
                Err(payload) => panic::resume_unwind(payload),
            }
        });
        drop(writer);
        progress.finish_and_clear();

        if let Some(e) = write_error {
            return Err(e);
        }
        if !failures.is_empty() {
            failures.sort_by_key(|f| f.time_index);
            warn!(
                "{} of {} downscaling jobs failed for {}",
                failures.len(),
                total,
                jobs.first().map(|j| j.watershed.as_str()).unwrap_or("?")
            );
            return Err(PipelineError::Conversion { total, failures });
        }

        let report = DownscaleReport {
            completed: total,
            elapsed: started.elapsed(),
        };
        info!(
            "Time to convert {} runoff files: {:.2?}",
            report.completed, report.elapsed
        );
        Ok(report)
    }

    fn run_job(
        &self,
        job: &JobDescriptor,
        reach_count: usize,
        weights: &WeightTable,
        converter: &dyn InflowConverter,
        sender: &SyncSender<(usize, Vec<f32>)>,
        cancelled: &AtomicBool,
        progress: &ProgressBar,
    ) -> Option<JobFailure> {
        let fail = |reason| JobFailure {
            time_index: job.time_index,
            runoff_file: job.runoff_file.clone(),
            reason,
        };

        if cancelled.load(Ordering::Relaxed) {
            progress.inc(1);
            return Some(fail(JobFailureReason::Cancelled));
        }

        debug!(
            watershed = %job.watershed,
            subbasin = %job.subbasin,
            time_index = job.time_index,
            "downscaling {}",
            job.runoff_file.display()
        );
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            converter.convert(&job.runoff_file, weights)
        }));
        let elapsed = started.elapsed();
        progress.inc(1);

        let reason = match outcome {
            Err(_) => Some(JobFailureReason::Conversion("converter panicked".to_string())),
            Ok(Err(e)) => Some(JobFailureReason::Conversion(format!("{:#}", e))),
            Ok(Ok(values)) if values.len() != reach_count => Some(JobFailureReason::ShapeMismatch {
                expected: reach_count,
                actual: values.len(),
            }),
            Ok(Ok(_)) if self.options.job_timeout.is_some_and(|limit| elapsed > limit) => {
                Some(JobFailureReason::TimedOut {
                    elapsed_secs: elapsed.as_secs_f64(),
                    limit_secs: self.options.job_timeout.map_or(0, |t| t.as_secs()),
                })
            }
            Ok(Ok(values)) => match sender.send((job.time_index, values)) {
                Ok(()) => None,
                Err(_) => Some(JobFailureReason::Conversion(
                    "inflow writer stopped before the row was stored".to_string(),
                )),
            },
        };

        let reason = reason?;
        if self.options.cancel_on_failure {
            cancelled.store(true, Ordering::Relaxed);
        }
        Some(fail(reason))
    }
}

// Jobs whose time index is outside the writable rows or already taken
fn unassigned_jobs(jobs: &[JobDescriptor], accumulator: &InflowAccumulator) -> Vec<JobFailure> {
    let writable = accumulator.writable();
    let mut taken = vec![false; writable.len()];
    let mut unassigned = Vec::new();
    for job in jobs {
        let free = writable.contains(&job.time_index) && !taken[job.time_index];
        if free {
            taken[job.time_index] = true;
        } else {
            unassigned.push(JobFailure {
                time_index: job.time_index,
                runoff_file: job.runoff_file.clone(),
                reason: JobFailureReason::Conversion(
                    "time index is out of range or already assigned".to_string(),
                ),
            });
        }
    }
    unassigned
}

impl Drop for DownscalePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
