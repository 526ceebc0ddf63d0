use crate::accumulator::InflowAccumulator;
use crate::batch::Collaborators;
use crate::catalog::Watershed;
use crate::config::{BatchConfig, FilePatterns, RoutingParameters};
use crate::downscale::{DownscalePool, PoolOptions, build_jobs};
use crate::error::{PipelineError, PipelineResult};
use crate::inventory::RunoffInventory;
use crate::io::csv::read_reach_ids;
use crate::io::results::WatershedOutputs;
use crate::locate::case_insensitive_file_search;
use crate::network::NetworkTopology;
use crate::routing::{NormalizeRequest, RoutingInputs, RoutingRequest};
use crate::state::{Stage, StageTracker, Terminal};
use crate::stats::StatisticsRequest;
use crate::weight_table::WeightTable;
use indicatif::{ProgressBar, ProgressStyle};
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Everything a watershed run shares with its siblings, all read-only.
pub struct BatchContext<'a> {
    pub config: &'a BatchConfig,
    pub patterns: &'a FilePatterns,
    pub inventory: &'a RunoffInventory,
    pub params: RoutingParameters,
    pub collaborators: &'a Collaborators,
}

#[derive(Debug, Clone)]
pub struct WatershedOutcome {
    pub watershed: Watershed,
    pub terminal: Terminal,
    pub stages: Vec<Stage>,
    pub outputs: WatershedOutputs,
    /// Set when return periods were requested but could not be produced.
    pub statistics_error: Option<String>,
    pub elapsed: Duration,
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({eta})")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

fn advance(tracker: &mut StageTracker, watershed: &Watershed, stage: Stage) {
    if tracker.advance(stage) {
        debug!(watershed = %watershed, "stage {}", stage);
    } else {
        warn!(
            watershed = %watershed,
            "refused transition {} -> {}",
            tracker.current(),
            stage
        );
    }
}

/// Runs one watershed from accumulation to statistics. Errors never escape:
/// they end the watershed in `Failed(stage, reason)`.
pub fn run_watershed(watershed: &Watershed, ctx: &BatchContext) -> WatershedOutcome {
    let started = Instant::now();
    let mut tracker = StageTracker::new();
    let mut outputs = WatershedOutputs::default();
    let mut statistics_error = None;

    info!(
        watershed = %watershed.watershed,
        subbasin = %watershed.subbasin,
        "Processing {}",
        watershed.directory_name
    );

    // A panicking collaborator fails this watershed, not the batch
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        run_stages(
            watershed,
            ctx,
            &mut tracker,
            &mut outputs,
            &mut statistics_error,
        )
    }));
    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
    };
    if let Some(reason) = failure {
        error!(
            watershed = %watershed,
            "failed at stage {}: {}",
            tracker.attempting(),
            reason
        );
        tracker.fail(reason);
    }

    let elapsed = started.elapsed();
    let terminal = tracker.terminal();
    info!(watershed = %watershed, "{} in {:.2?}", terminal, elapsed);

    WatershedOutcome {
        watershed: watershed.clone(),
        terminal,
        stages: tracker.history().to_vec(),
        outputs,
        statistics_error,
        elapsed,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn run_stages(
    watershed: &Watershed,
    ctx: &BatchContext,
    tracker: &mut StageTracker,
    outputs: &mut WatershedOutputs,
    statistics_error: &mut Option<String>,
) -> PipelineResult<()> {
    let config = ctx.config;
    let patterns = ctx.patterns;
    let input_dir = &watershed.input_dir;
    let output_dir = &watershed.output_dir;

    advance(tracker, watershed, Stage::InventoryReady);

    // Accumulator
    tracker.attempt(Stage::AccumulatorInitialized);
    fs::create_dir_all(output_dir).map_err(|e| PipelineError::io(output_dir, e))?;
    let weight_table_file = case_insensitive_file_search(input_dir, &patterns.weight_table)?;
    let weights = WeightTable::load(&weight_table_file)?;
    let inflow_file = output_dir.join(&patterns.inflow_output);
    let accumulator = InflowAccumulator::create(&inflow_file, &weights, ctx.inventory.len())?;
    outputs.inflow = Some(inflow_file.clone());
    advance(tracker, watershed, Stage::AccumulatorInitialized);

    // Downscaling
    tracker.attempt(Stage::Downscaled);
    let jobs = build_jobs(watershed, ctx.inventory, &weights, &accumulator);
    let mut pool = DownscalePool::new(PoolOptions::from_config(config))?;
    info!(
        "ERAI downscaling for {}: {} files on {} workers",
        watershed,
        jobs.len(),
        pool.workers()
    );
    let progress = progress_bar(jobs.len(), config.show_progress);
    pool.run_all(
        &jobs,
        &weights,
        ctx.collaborators.converter.as_ref(),
        &accumulator,
        &progress,
    )?;
    pool.shutdown();
    advance(tracker, watershed, Stage::Downscaled);

    // Routing
    tracker.attempt(Stage::Routed);
    let inputs = RoutingInputs {
        connectivity: case_insensitive_file_search(input_dir, &patterns.connectivity)?,
        riv_bas_id: case_insensitive_file_search(input_dir, &patterns.riv_bas_id)?,
        k: case_insensitive_file_search(input_dir, &patterns.k)?,
        x: case_insensitive_file_search(input_dir, &patterns.x)?,
        station_metadata: case_insensitive_file_search(input_dir, &patterns.comid_lat_lon_z)?,
    };
    let network = NetworkTopology::load(&inputs.connectivity)?;
    let basin_ids = read_reach_ids(&inputs.riv_bas_id)?;
    if basin_ids.len() != weights.reach_count() {
        warn!(
            "{}: weight table has {} reaches, basin file lists {}",
            watershed,
            weights.reach_count(),
            basin_ids.len()
        );
    }
    let request = RoutingRequest {
        params: ctx.params,
        reach_counts: network.reach_counts(&basin_ids),
        inputs,
        vlat_file: inflow_file,
        qout_file: output_dir.join(&patterns.qout_raw_output),
        working_dir: output_dir.clone(),
    };
    ctx.collaborators
        .routing
        .run(&request)
        .map_err(|e| PipelineError::RoutingInvocation(format!("{:#}", e)))?;
    advance(tracker, watershed, Stage::Routed);

    // CF conformance
    tracker.attempt(Stage::Normalized);
    let discharge_file = output_dir.join(&patterns.qout_output);
    ctx.collaborators
        .normalizer
        .normalize(&NormalizeRequest {
            raw_qout: request.qout_file.clone(),
            output: discharge_file.clone(),
            station_metadata: request.inputs.station_metadata.clone(),
            simulation_start: config.simulation_start,
            step_seconds: ctx.params.zs_tau_r,
            project_name: config.project_name.clone(),
        })
        .map_err(|e| PipelineError::Normalization(format!("{:#}", e)))?;
    outputs.discharge = Some(discharge_file.clone());
    advance(tracker, watershed, Stage::Normalized);

    // Return periods
    if config.generate_return_periods {
        let return_periods_file = output_dir.join(&patterns.return_periods_output);
        let generated = ctx
            .collaborators
            .statistics
            .generate(&StatisticsRequest {
                discharge_file,
                output: return_periods_file.clone(),
                station_metadata: request.inputs.station_metadata.clone(),
                step_seconds: ctx.params.zs_tau_r,
            })
            .map_err(|e| PipelineError::Statistics(format!("{:#}", e)));
        match generated {
            Ok(()) => {
                outputs.return_periods = Some(return_periods_file);
                advance(tracker, watershed, Stage::StatisticsGenerated);
            }
            Err(e) => {
                warn!(watershed = %watershed, "{}", e);
                *statistics_error = Some(e.to_string());
                advance(tracker, watershed, Stage::StatisticsSkipped);
            }
        }
    } else {
        advance(tracker, watershed, Stage::StatisticsSkipped);
    }

    advance(tracker, watershed, Stage::Done);
    Ok(())
}
