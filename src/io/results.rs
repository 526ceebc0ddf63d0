use std::path::PathBuf;

// Discharge time series as read back from a routing output file
#[derive(Debug, Clone, PartialEq)]
pub struct Discharge {
    pub rivids: Vec<i64>,
    pub time_len: usize,
    /// Time-major: `flow[t * rivids.len() + r]`.
    pub flow: Vec<f32>,
}

impl Discharge {
    /// Flow of one reach through time. Stops early rather than reading past
    /// `flow` if the matrix is shorter than `rivids x time_len`.
    pub fn series(&self, reach: usize) -> impl Iterator<Item = f32> + '_ {
        let n = self.rivids.len().max(1);
        self.flow
            .iter()
            .skip(reach)
            .step_by(n)
            .take(self.time_len)
            .copied()
    }
}

// Files produced for one watershed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatershedOutputs {
    pub inflow: Option<PathBuf>,
    pub discharge: Option<PathBuf>,
    pub return_periods: Option<PathBuf>,
}
