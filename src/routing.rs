use crate::config::RoutingParameters;
use crate::io::csv::read_stations;
use crate::io::netcdf::{read_discharge, write_cf_discharge};
use crate::network::ReachCounts;
use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

// Per-watershed topology and coefficient files located in the input directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInputs {
    pub connectivity: PathBuf,
    pub riv_bas_id: PathBuf,
    pub k: PathBuf,
    pub x: PathBuf,
    pub station_metadata: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRequest {
    pub params: RoutingParameters,
    pub inputs: RoutingInputs,
    pub reach_counts: ReachCounts,
    /// Lateral inflow produced by the downscaler.
    pub vlat_file: PathBuf,
    pub qout_file: PathBuf,
    /// Private to one watershed; the model is not assumed to be reentrant.
    pub working_dir: PathBuf,
}

/// The external river routing solver.
pub trait RoutingModel: Send + Sync {
    /// Runs synchronously and leaves a raw discharge file at `request.qout_file`.
    fn run(&self, request: &RoutingRequest) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeRequest {
    pub raw_qout: PathBuf,
    pub output: PathBuf,
    pub station_metadata: PathBuf,
    pub simulation_start: NaiveDateTime,
    pub step_seconds: u64,
    pub project_name: String,
}

/// Rewrites raw routing output into a CF-conformant file.
pub trait CfNormalizer: Send + Sync {
    fn normalize(&self, request: &NormalizeRequest) -> Result<()>;
}

fn quoted(path: &Path) -> String {
    format!("'{}'", path.display())
}

/// Namelist consumed by the routing executable from its working directory.
pub fn render_namelist(request: &RoutingRequest) -> String {
    let p = &request.params;
    let c = &request.reach_counts;
    let entries: [(&str, String); 25] = [
        ("BS_opt_Qinit", ".false.".into()),
        ("BS_opt_Qfinal", ".false.".into()),
        ("BS_opt_dam", ".false.".into()),
        ("BS_opt_for", ".false.".into()),
        ("BS_opt_influence", ".false.".into()),
        ("BS_opt_uq", ".false.".into()),
        ("IS_opt_routing", "1".into()),
        ("IS_opt_run", "1".into()),
        ("IS_opt_phi", "1".into()),
        ("IS_riv_tot", c.riv_tot.to_string()),
        ("IS_riv_bas", c.riv_bas.to_string()),
        ("IS_max_up", c.max_up.to_string()),
        ("ZS_TauM", p.zs_tau_m.to_string()),
        ("ZS_dtM", p.zs_dt_m.to_string()),
        ("ZS_TauR", p.zs_tau_r.to_string()),
        ("ZS_dtR", p.zs_dt_r.to_string()),
        ("rapid_connect_file", quoted(&request.inputs.connectivity)),
        ("Vlat_file", quoted(&request.vlat_file)),
        ("riv_bas_id_file", quoted(&request.inputs.riv_bas_id)),
        ("k_file", quoted(&request.inputs.k)),
        ("x_file", quoted(&request.inputs.x)),
        ("Qout_file", quoted(&request.qout_file)),
        ("Qinit_file", "''".into()),
        ("Qfinal_file", "''".into()),
        ("Qfor_file", "''".into()),
    ];

    let body: String = entries
        .iter()
        .map(|(key, value)| format!("{} = {}\n", key, value))
        .collect();
    format!("&NL_namelist\n{}/\n", body)
}

// Runs the routing executable, optionally under mpiexec
#[derive(Debug, Clone)]
pub struct RapidExecutable {
    pub executable: PathBuf,
    pub mpiexec: Option<PathBuf>,
    pub processes: usize,
    pub namelist_name: String,
}

impl RapidExecutable {
    fn command(&self) -> Command {
        match &self.mpiexec {
            Some(mpiexec) => {
                let mut cmd = Command::new(mpiexec);
                cmd.arg("-n")
                    .arg(self.processes.max(1).to_string())
                    .arg(&self.executable);
                cmd
            }
            None => Command::new(&self.executable),
        }
    }
}

impl RoutingModel for RapidExecutable {
    fn run(&self, request: &RoutingRequest) -> Result<()> {
        fs::create_dir_all(&request.working_dir).with_context(|| {
            format!("Failed to create {}", request.working_dir.display())
        })?;
        let namelist_path = request.working_dir.join(&self.namelist_name);
        fs::write(&namelist_path, render_namelist(request))
            .with_context(|| format!("Failed to write {}", namelist_path.display()))?;

        info!(
            "Running {} in {}",
            self.executable.display(),
            request.working_dir.display()
        );
        let output = self
            .command()
            .current_dir(&request.working_dir)
            .output()
            .with_context(|| format!("Failed to start {}", self.executable.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!(target: "rapid", "{}", line);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<_> = stderr.lines().rev().take(20).collect();
            bail!(
                "{} exited with {}: {}",
                self.executable.display(),
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join("\n")
            );
        }
        if !request.qout_file.exists() {
            bail!(
                "{} finished but produced no {}",
                self.executable.display(),
                request.qout_file.display()
            );
        }
        Ok(())
    }
}

// Default CF conversion built on the netCDF writers
#[derive(Debug, Clone, Copy, Default)]
pub struct CfConverter;

impl CfNormalizer for CfConverter {
    fn normalize(&self, request: &NormalizeRequest) -> Result<()> {
        let discharge = read_discharge(&request.raw_qout)?;
        let stations = read_stations(&request.station_metadata)?;
        write_cf_discharge(
            &request.output,
            &discharge,
            &stations,
            &request.simulation_start,
            request.step_seconds,
            &request.project_name,
        )?;
        if request.raw_qout != request.output {
            fs::remove_file(&request.raw_qout)
                .with_context(|| format!("Failed to remove {}", request.raw_qout.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::results::Discharge;
    use tempfile::TempDir;

    fn request(dir: &Path) -> RoutingRequest {
        RoutingRequest {
            params: RoutingParameters::from_inventory(3),
            inputs: RoutingInputs {
                connectivity: dir.join("rapid_connect.csv"),
                riv_bas_id: dir.join("riv_bas_id.csv"),
                k: dir.join("k.csv"),
                x: dir.join("x.csv"),
                station_metadata: dir.join("comid_lat_lon_z.csv"),
            },
            reach_counts: ReachCounts {
                riv_tot: 5,
                riv_bas: 5,
                max_up: 2,
            },
            vlat_file: dir.join("m3_riv_bas_erai.nc"),
            qout_file: dir.join("Qout_erai_raw.nc"),
            working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn namelist_carries_parameters_and_files() {
        let namelist = render_namelist(&request(Path::new("/io/NAMIBIA-1")));
        assert!(namelist.starts_with("&NL_namelist\n"));
        assert!(namelist.ends_with("/\n"));
        assert!(namelist.contains("ZS_TauM = 259200\n"));
        assert!(namelist.contains("ZS_dtR = 900\n"));
        assert!(namelist.contains("IS_max_up = 2\n"));
        assert!(namelist.contains("Vlat_file = '/io/NAMIBIA-1/m3_riv_bas_erai.nc'\n"));
    }

    #[test]
    fn missing_executable_is_an_error() {
        let temp = TempDir::new().unwrap();
        let rapid = RapidExecutable {
            executable: temp.path().join("no-such-rapid"),
            mpiexec: None,
            processes: 1,
            namelist_name: "rapid_namelist".to_string(),
        };
        assert!(rapid.run(&request(temp.path())).is_err());
        assert!(temp.path().join("rapid_namelist").exists());
    }

    #[test]
    fn cf_converter_replaces_raw_output() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("Qout_erai_raw.nc");
        {
            let mut file = netcdf::create(&raw).unwrap();
            file.add_dimension("Time", 2).unwrap();
            file.add_dimension("COMID", 2).unwrap();
            let mut ids = file.add_variable::<i32>("COMID", &["COMID"]).unwrap();
            ids.put_values(&[7, 8], ..).unwrap();
            let mut q = file.add_variable::<f32>("Qout", &["Time", "COMID"]).unwrap();
            q.put_values(&[1.0f32, 2.0, 3.0, 4.0], ..).unwrap();
        }
        let stations = temp.path().join("comid_lat_lon_z.csv");
        fs::write(&stations, "rivid,lat,lon,z\n7,-22.0,17.0,900\n8,-22.1,17.2,880\n").unwrap();

        let output = temp.path().join("Qout_erai.nc");
        CfConverter
            .normalize(&NormalizeRequest {
                raw_qout: raw.clone(),
                output: output.clone(),
                station_metadata: stations,
                simulation_start: NaiveDateTime::parse_from_str(
                    "1980-01-01 00:00:00",
                    "%Y-%m-%d %H:%M:%S",
                )
                .unwrap(),
                step_seconds: 86400,
                project_name: "test".to_string(),
            })
            .unwrap();

        assert!(!raw.exists());
        assert_eq!(
            read_discharge(&output).unwrap(),
            Discharge {
                rivids: vec![7, 8],
                time_len: 2,
                flow: vec![1.0, 2.0, 3.0, 4.0],
            }
        );
    }
}
