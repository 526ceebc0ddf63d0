use crate::error::{PipelineError, PipelineResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// One grid cell's contribution to one reach
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellWeight {
    /// Position of the reach in `WeightTable::reach_ids`.
    pub reach: usize,
    pub lat_index: i64,
    pub lon_index: i64,
    pub area_sqm: f64,
}

impl CellWeight {
    /// Weight tables mark reaches without any overlapping cell with negative indices.
    pub fn grid_cell(&self) -> Option<(usize, usize)> {
        if self.lat_index < 0 || self.lon_index < 0 {
            None
        } else {
            Some((self.lat_index as usize, self.lon_index as usize))
        }
    }
}

/// Mapping from river reaches to the grid cells draining into them.
///
/// Reaches keep the order in which they first appear in the file; that order
/// is the space dimension of the inflow accumulator.
#[derive(Debug, Clone)]
pub struct WeightTable {
    path: PathBuf,
    reach_ids: Vec<i64>,
    cells: Vec<CellWeight>,
}

impl WeightTable {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let rows = crate::io::csv::read_weight_rows(path)?;
        Self::from_rows(path, rows)
    }

    /// Builds a table from `(reach_id, area_sqm, lat_index, lon_index)` rows.
    pub fn from_rows(
        path: &Path,
        rows: impl IntoIterator<Item = (i64, f64, i64, i64)>,
    ) -> PipelineResult<Self> {
        let mut reach_ids = Vec::new();
        let mut positions: HashMap<i64, usize> = HashMap::new();
        let mut cells = Vec::new();

        for (reach_id, area_sqm, lat_index, lon_index) in rows {
            if !area_sqm.is_finite() || area_sqm < 0.0 {
                return Err(PipelineError::InvalidWeightTable {
                    path: path.to_path_buf(),
                    reason: format!("reach {} has invalid area {}", reach_id, area_sqm),
                });
            }
            let reach = *positions.entry(reach_id).or_insert_with(|| {
                reach_ids.push(reach_id);
                reach_ids.len() - 1
            });
            cells.push(CellWeight {
                reach,
                lat_index,
                lon_index,
                area_sqm,
            });
        }

        if reach_ids.is_empty() {
            return Err(PipelineError::InvalidWeightTable {
                path: path.to_path_buf(),
                reason: "no reaches".to_string(),
            });
        }

        Ok(WeightTable {
            path: path.to_path_buf(),
            reach_ids,
            cells,
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

    pub fn cells(&self) -> &[CellWeight] {
        &self.cells
    }
}
