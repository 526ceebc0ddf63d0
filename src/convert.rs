use crate::weight_table::WeightTable;
use anyhow::{Result, bail};
use std::path::Path;

/// Runoff depth (m) for one source file, already summed over its time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct RunoffGrid {
    pub lat_len: usize,
    pub lon_len: usize,
    /// Row-major `lat x lon`.
    pub depth_m: Vec<f64>,
}

impl RunoffGrid {
    pub fn depth(&self, lat: usize, lon: usize) -> Option<f64> {
        if lat >= self.lat_len || lon >= self.lon_len {
            return None;
        }
        self.depth_m.get(lat * self.lon_len + lon).copied()
    }
}

/// Turns one runoff file into a reach-indexed inflow vector.
///
/// Implementations are shared across the worker pool, must only read their
/// inputs, and return exactly `weights.reach_count()` values.
pub trait InflowConverter: Send + Sync {
    fn convert(&self, runoff_file: &Path, weights: &WeightTable) -> Result<Vec<f32>>;
}

/// Weighted sum of overlapping cells per reach, in m3. Negative runoff
/// (a reanalysis artefact) contributes nothing.
pub fn accumulate_inflow(grid: &RunoffGrid, weights: &WeightTable) -> Result<Vec<f32>> {
    let mut inflow = vec![0.0f64; weights.reach_count()];
    for cell in weights.cells() {
        let Some((lat, lon)) = cell.grid_cell() else {
            continue;
        };
        let Some(depth) = grid.depth(lat, lon) else {
            bail!(
                "cell (lat {}, lon {}) of reach {} is outside the {}x{} runoff grid",
                lat,
                lon,
                weights.reach_ids()[cell.reach],
                grid.lat_len,
                grid.lon_len
            );
        };
        inflow[cell.reach] += depth.max(0.0) * cell.area_sqm;
    }
    Ok(inflow.into_iter().map(|v| v as f32).collect())
}

// Default conversion routine reading reanalysis runoff from netCDF
#[derive(Debug, Clone)]
pub struct NetCdfRunoffConverter {
    pub variables: Vec<String>,
}

impl NetCdfRunoffConverter {
    pub fn new(variables: Vec<String>) -> Self {
        NetCdfRunoffConverter { variables }
    }
}

impl InflowConverter for NetCdfRunoffConverter {
    fn convert(&self, runoff_file: &Path, weights: &WeightTable) -> Result<Vec<f32>> {
        let grid = crate::io::netcdf::read_runoff_grid(runoff_file, &self.variables)?;
        accumulate_inflow(&grid, weights)
    }
}
