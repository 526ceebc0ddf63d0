use crate::error::{PipelineError, PipelineResult};
use crate::io::netcdf::{
    create_inflow_file, open_inflow_for_writing, read_inflow, read_inflow_layout, write_inflow_row,
};
use crate::weight_table::WeightTable;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Time-indexed lateral inflow file for one watershed, `(N + 1) x reaches`.
///
/// Rows `0..N` belong to the N runoff files in inventory order. The last row
/// is the boundary slot the routing model expects; it is never written by the
/// downscaler and stays zero. Dimensions are fixed at creation and rows are
/// written one at a time by a single [`InflowWriter`], so the full grid is
/// never held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct InflowAccumulator {
    path: PathBuf,
    reach_ids: Vec<i64>,
    time_len: usize,
}

impl InflowAccumulator {
    /// Creates (or truncates) the accumulator file at `path` with every slot
    /// zeroed.
    pub fn create(path: &Path, weights: &WeightTable, runoff_count: usize) -> PipelineResult<Self> {
        let accumulator = Self::layout(path, weights.reach_ids().to_vec(), runoff_count)?;
        create_inflow_file(path, &accumulator.reach_ids, accumulator.time_len)?;
        debug!(
            "initialized {} with {} time steps x {} reaches",
            path.display(),
            accumulator.time_len,
            accumulator.reach_count()
        );
        Ok(accumulator)
    }

    /// Shape of an accumulator for `runoff_count` files, without touching disk.
    pub fn layout(path: &Path, reach_ids: Vec<i64>, runoff_count: usize) -> PipelineResult<Self> {
        if runoff_count == 0 {
            return Err(PipelineError::EmptyInventory {
                root: path.to_path_buf(),
                extension: crate::config::RUNOFF_EXTENSION.to_string(),
            });
        }
        Ok(InflowAccumulator {
            path: path.to_path_buf(),
            reach_ids,
            time_len: runoff_count + 1,
        })
    }

    pub fn open(path: &Path) -> PipelineResult<Self> {
        let (reach_ids, time_len) = read_inflow_layout(path)?;
        Ok(InflowAccumulator {
            path: path.to_path_buf(),
            reach_ids,
            time_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reach_ids(&self) -> &[i64] {
        &self.reach_ids
    }

    pub fn reach_count(&self) -> usize {
        self.reach_ids.len()
    }

    pub fn time_len(&self) -> usize {
        self.time_len
    }

    /// Index of the boundary slot.
    pub fn reserved_index(&self) -> usize {
        self.time_len - 1
    }

    /// Time indices the downscaler may write. The boundary slot is excluded.
    pub fn writable(&self) -> Range<usize> {
        0..self.reserved_index()
    }

    pub fn writer(&self) -> PipelineResult<InflowWriter> {
        Ok(InflowWriter {
            file: open_inflow_for_writing(&self.path)?,
            path: self.path.clone(),
            reach_count: self.reach_count(),
            writable: self.writable(),
            written: 0,
        })
    }

    /// Reads the whole grid back, time-major.
    pub fn read_values(&self) -> PipelineResult<Vec<f32>> {
        let (_, _, values) = read_inflow(&self.path)?;
        Ok(values)
    }

    pub fn read_row(&self, time_index: usize) -> PipelineResult<Vec<f32>> {
        let n = self.reach_count();
        let values = self.read_values()?;
        Ok(values
            .get(time_index * n..(time_index + 1) * n)
            .map(<[f32]>::to_vec)
            .unwrap_or_default())
    }
}

/// The single writer of an accumulator file. Rows arrive in any order.
pub struct InflowWriter {
    file: netcdf::FileMut,
    path: PathBuf,
    reach_count: usize,
    writable: Range<usize>,
    written: usize,
}

impl InflowWriter {
    pub fn write_row(&mut self, time_index: usize, row: &[f32]) -> PipelineResult<()> {
        if !self.writable.contains(&time_index) || row.len() != self.reach_count {
            return Err(PipelineError::InvalidNetCdf {
                path: self.path.clone(),
                reason: format!(
                    "refused row {} of {} values; writable rows are {:?} of {} values",
                    time_index,
                    row.len(),
                    self.writable,
                    self.reach_count
                ),
            });
        }
        write_inflow_row(&mut self.file, &self.path, time_index, row)?;
        self.written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.written
    }
}
