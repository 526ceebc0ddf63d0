use crate::error::{PipelineError, PipelineResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// One row of the connectivity file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRow {
    pub id: i64,
    pub downstream: Option<i64>,
    pub upstream: Vec<i64>,
}

// Network node representing a river reach
#[derive(Debug, Clone)]
pub struct NetworkNode {
    pub id: i64,
    pub downstream_id: Option<i64>,
    pub upstream_ids: Vec<i64>,
}

// Network topology
#[derive(Debug, Clone)]
pub struct NetworkTopology {
    pub path: PathBuf,
    pub nodes: HashMap<i64, NetworkNode>,
    pub routing_order: Vec<i64>,
    /// Largest upstream count declared by any connectivity row.
    pub max_upstream: usize,
}

/// Reach counts the routing model needs in its namelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachCounts {
    pub riv_tot: usize,
    pub riv_bas: usize,
    pub max_up: usize,
}

impl NetworkTopology {
    pub fn from_rows(path: &Path, rows: Vec<ConnectRow>) -> PipelineResult<Self> {
        let mut topology = NetworkTopology {
            path: path.to_path_buf(),
            nodes: HashMap::new(),
            routing_order: Vec::new(),
            max_upstream: 0,
        };

        for row in &rows {
            topology.max_upstream = topology.max_upstream.max(row.upstream.len());
            let node = NetworkNode {
                id: row.id,
                downstream_id: row.downstream,
                upstream_ids: Vec::new(),
            };
            if topology.nodes.insert(row.id, node).is_some() {
                return Err(topology.invalid(format!("reach {} listed twice", row.id)));
            }
        }

        let outside: Vec<_> = topology
            .nodes
            .values()
            .filter_map(|n| n.downstream_id.filter(|ds| !topology.nodes.contains_key(ds)))
            .collect();
        if !outside.is_empty() {
            debug!("{} reaches drain outside the domain", outside.len());
        }

        topology.build_upstream_connections();
        topology.topological_sort()?;
        Ok(topology)
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let rows = crate::io::csv::read_connectivity(path)?;
        Self::from_rows(path, rows)
    }

    fn invalid(&self, reason: String) -> PipelineError {
        PipelineError::InvalidNetwork {
            path: self.path.clone(),
            reason,
        }
    }

    pub fn build_upstream_connections(&mut self) {
        let mut upstream_map: HashMap<i64, Vec<i64>> = HashMap::new();

        for (id, node) in &self.nodes {
            if let Some(downstream) = node.downstream_id {
                upstream_map.entry(downstream).or_default().push(*id);
            }
        }

        for (id, mut upstreams) in upstream_map {
            if let Some(node) = self.nodes.get_mut(&id) {
                upstreams.sort_unstable();
                node.upstream_ids = upstreams;
            }
        }
    }

    pub fn topological_sort(&mut self) -> PipelineResult<()> {
        let mut in_degree: HashMap<i64, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();

        for node in self.nodes.values() {
            if let Some(downstream) = node.downstream_id {
                if let Some(degree) = in_degree.get_mut(&downstream) {
                    *degree += 1;
                }
            }
        }

        // Headwaters, sorted so the order is reproducible
        let mut headwaters: Vec<i64> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        headwaters.sort_unstable();
        let mut queue: VecDeque<i64> = headwaters.into();

        if queue.is_empty() && !self.nodes.is_empty() {
            return Err(self.invalid("no headwater reaches - possible cycle in network".into()));
        }

        self.routing_order.clear();
        while let Some(current) = queue.pop_front() {
            self.routing_order.push(current);

            if let Some(downstream) = self.nodes.get(&current).and_then(|n| n.downstream_id) {
                if let Some(degree) = in_degree.get_mut(&downstream) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(downstream);
                    }
                }
            }
        }

        if self.routing_order.len() != self.nodes.len() {
            return Err(self.invalid(format!(
                "cycle detected: ordered {} reaches out of {}",
                self.routing_order.len(),
                self.nodes.len()
            )));
        }

        Ok(())
    }

    /// Counts for a routed basin; basin reaches missing from the
    /// connectivity file are reported but not fatal.
    pub fn reach_counts(&self, basin_ids: &[i64]) -> ReachCounts {
        let known: HashSet<_> = self.nodes.keys().collect();
        let missing = basin_ids.iter().filter(|id| !known.contains(id)).count();
        if missing > 0 {
            warn!(
                "{} of {} basin reaches are absent from {}",
                missing,
                basin_ids.len(),
                self.path.display()
            );
        }
        ReachCounts {
            riv_tot: self.nodes.len(),
            riv_bas: basin_ids.len(),
            max_up: self.max_upstream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, downstream: i64, upstream: &[i64]) -> ConnectRow {
        ConnectRow {
            id,
            downstream: (downstream != 0).then_some(downstream),
            upstream: upstream.to_vec(),
        }
    }

    #[test]
    fn headwaters_route_before_outlet() {
        let rows = vec![row(3, 0, &[1, 2]), row(1, 3, &[]), row(2, 3, &[])];
        let topology = NetworkTopology::from_rows(Path::new("c.csv"), rows).unwrap();
        assert_eq!(topology.routing_order, vec![1, 2, 3]);
        assert_eq!(topology.nodes[&3].upstream_ids, vec![1, 2]);
        assert_eq!(
            topology.reach_counts(&[1, 2, 3]),
            ReachCounts {
                riv_tot: 3,
                riv_bas: 3,
                max_up: 2
            }
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let rows = vec![row(1, 2, &[3]), row(2, 3, &[1]), row(3, 1, &[2]), row(4, 1, &[])];
        let err = NetworkTopology::from_rows(Path::new("c.csv"), rows).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidNetwork { .. }));
    }

    #[test]
    fn duplicate_reaches_are_rejected() {
        let rows = vec![row(1, 0, &[]), row(1, 0, &[])];
        assert!(NetworkTopology::from_rows(Path::new("c.csv"), rows).is_err());
    }

    #[test]
    fn downstream_outside_domain_is_an_outlet() {
        let rows = vec![row(5, 99, &[])];
        let topology = NetworkTopology::from_rows(Path::new("c.csv"), rows).unwrap();
        assert_eq!(topology.routing_order, vec![5]);
    }
}
