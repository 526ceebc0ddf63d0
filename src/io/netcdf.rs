use crate::convert::RunoffGrid;
use crate::error::{PipelineError, PipelineResult};
use crate::io::csv::Station;
use crate::io::results::Discharge;
use crate::stats::ReturnPeriods;
use chrono::{NaiveDateTime, Utc};
use netcdf::AttributeValue;
use std::collections::HashMap;
use std::path::Path;

pub const INFLOW_VARIABLE: &str = "m3_riv";
pub const DISCHARGE_VARIABLE: &str = "Qout";
const FILL_VALUE: f32 = -9999.0;

fn invalid(path: &Path, reason: String) -> PipelineError {
    PipelineError::InvalidNetCdf {
        path: path.to_path_buf(),
        reason,
    }
}

fn missing(path: &Path, what: &str) -> PipelineError {
    invalid(path, format!("variable '{}' not found", what))
}

fn numeric_attribute(var: &netcdf::Variable, name: &str) -> Option<f64> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Double(v) => Some(v),
        AttributeValue::Float(v) => Some(v as f64),
        AttributeValue::Int(v) => Some(v as f64),
        AttributeValue::Short(v) => Some(v as f64),
        _ => None,
    }
}

// Integer ids may be stored as int or int64 depending on the producer
fn read_ids(var: &netcdf::Variable) -> PipelineResult<Vec<i64>> {
    match var.get_values::<i64, _>(..) {
        Ok(ids) => Ok(ids),
        Err(_) => Ok(var
            .get_values::<i32, _>(..)?
            .into_iter()
            .map(i64::from)
            .collect()),
    }
}

fn read_f32(var: &netcdf::Variable) -> PipelineResult<Vec<f32>> {
    match var.get_values::<f32, _>(..) {
        Ok(values) => Ok(values),
        Err(_) => Ok(var
            .get_values::<f64, _>(..)?
            .into_iter()
            .map(|v| v as f32)
            .collect()),
    }
}

// Packed reanalysis fields are usually short integers
fn read_f64(var: &netcdf::Variable) -> PipelineResult<Vec<f64>> {
    if let Ok(values) = var.get_values::<f64, _>(..) {
        return Ok(values);
    }
    if let Ok(values) = var.get_values::<f32, _>(..) {
        return Ok(values.into_iter().map(f64::from).collect());
    }
    Ok(var
        .get_values::<i16, _>(..)?
        .into_iter()
        .map(f64::from)
        .collect())
}

/// Creates the inflow file with fixed dimensions and every slot zeroed.
/// Nothing about its structure changes after this returns.
pub fn create_inflow_file(path: &Path, reach_ids: &[i64], time_len: usize) -> PipelineResult<()> {
    let mut file = netcdf::create(path)?;

    file.add_dimension("Time", time_len)?;
    file.add_dimension("rivid", reach_ids.len())?;

    let mut rivid_var = file.add_variable::<i64>("rivid", &["rivid"])?;
    rivid_var.put_attribute("long_name", "unique identifier for each river reach")?;
    rivid_var.put_attribute("cf_role", "timeseries_id")?;
    rivid_var.put_values(reach_ids, ..)?;

    let mut inflow_var = file.add_variable::<f32>(INFLOW_VARIABLE, &["Time", "rivid"])?;
    inflow_var.put_attribute("long_name", "accumulated external water volume inflow")?;
    inflow_var.put_attribute("units", "m3")?;
    // One row at a time so memory stays at one time step
    let zeros = vec![0.0f32; reach_ids.len()];
    if !zeros.is_empty() {
        for t in 0..time_len {
            inflow_var.put_values(&zeros, (&t, ..))?;
        }
    }

    file.add_attribute("title", "Lateral inflow accumulated from gridded runoff")?;
    file.add_attribute(
        "history",
        format!("date_created: {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ")),
    )?;

    Ok(())
}

/// Opens an existing inflow file for row writes.
pub fn open_inflow_for_writing(path: &Path) -> PipelineResult<netcdf::FileMut> {
    let file = netcdf::append(path)?;
    if file.variable(INFLOW_VARIABLE).is_none() {
        return Err(missing(path, INFLOW_VARIABLE));
    }
    Ok(file)
}

/// Writes one `rivid` row of the inflow grid at `time_index`.
pub fn write_inflow_row(
    file: &mut netcdf::FileMut,
    path: &Path,
    time_index: usize,
    row: &[f32],
) -> PipelineResult<()> {
    let mut var = file
        .variable_mut(INFLOW_VARIABLE)
        .ok_or_else(|| missing(path, INFLOW_VARIABLE))?;
    var.put_values(row, (&time_index, ..))?;
    Ok(())
}

/// Reads the inflow file's reach ids and time length without its values.
pub fn read_inflow_layout(path: &Path) -> PipelineResult<(Vec<i64>, usize)> {
    let file = netcdf::open(path)?;
    let rivids = read_ids(&file.variable("rivid").ok_or_else(|| missing(path, "rivid"))?)?;
    let var = file
        .variable(INFLOW_VARIABLE)
        .ok_or_else(|| missing(path, INFLOW_VARIABLE))?;
    let time_len = var.dimensions().first().map(|d| d.len()).unwrap_or(0);
    Ok((rivids, time_len))
}

/// Reads back `(rivids, time_len, values)` from an inflow file.
pub fn read_inflow(path: &Path) -> PipelineResult<(Vec<i64>, usize, Vec<f32>)> {
    let file = netcdf::open(path)?;
    let rivids = read_ids(&file.variable("rivid").ok_or_else(|| missing(path, "rivid"))?)?;
    let var = file
        .variable(INFLOW_VARIABLE)
        .ok_or_else(|| missing(path, INFLOW_VARIABLE))?;
    let time_len = var.dimensions().first().map(|d| d.len()).unwrap_or(0);
    let values = read_f32(&var)?;
    Ok((rivids, time_len, values))
}

/// Reads a runoff grid, unpacking `scale_factor`/`add_offset` and summing
/// every leading (time) axis into one `lat x lon` field.
pub fn read_runoff_grid(path: &Path, variables: &[String]) -> PipelineResult<RunoffGrid> {
    let file = netcdf::open(path)?;
    let var = variables
        .iter()
        .find_map(|name| file.variable(name))
        .ok_or_else(|| missing(path, &variables.join("|")))?;

    let dims: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
    if dims.len() < 2 {
        return Err(invalid(
            path,
            format!("runoff variable needs lat and lon dimensions, found {}", dims.len()),
        ));
    }
    let lat_len = dims[dims.len() - 2];
    let lon_len = dims[dims.len() - 1];
    let plane = lat_len * lon_len;

    let scale = numeric_attribute(&var, "scale_factor").unwrap_or(1.0);
    let offset = numeric_attribute(&var, "add_offset").unwrap_or(0.0);
    let fill = numeric_attribute(&var, "_FillValue").or_else(|| numeric_attribute(&var, "missing_value"));

    let raw = read_f64(&var)?;
    let mut depth_m = vec![0.0f64; plane];
    for chunk in raw.chunks_exact(plane.max(1)) {
        for (cell, value) in depth_m.iter_mut().zip(chunk) {
            if fill.is_some_and(|f| *value == f) {
                continue;
            }
            *cell += value * scale + offset;
        }
    }

    Ok(RunoffGrid {
        lat_len,
        lon_len,
        depth_m,
    })
}

/// Reads routed discharge (`Qout`, time-major) and its reach ids.
pub fn read_discharge(path: &Path) -> PipelineResult<Discharge> {
    let file = netcdf::open(path)?;
    let rivids = read_ids(
        &["rivid", "COMID"]
            .iter()
            .find_map(|name| file.variable(name))
            .ok_or_else(|| missing(path, "rivid|COMID"))?,
    )?;
    let var = file
        .variable(DISCHARGE_VARIABLE)
        .ok_or_else(|| missing(path, DISCHARGE_VARIABLE))?;
    let dims: Vec<(String, usize)> = var
        .dimensions()
        .iter()
        .map(|d| (d.name(), d.len()))
        .collect();
    let values = read_f32(&var)?;

    let n = rivids.len();
    let time_len = match dims.as_slice() {
        [(first, _), (_, time_len)] if first.eq_ignore_ascii_case("rivid") || first == "COMID" => {
            *time_len
        }
        [(_, time_len), _] => *time_len,
        _ => {
            return Err(invalid(path, "Qout must be two-dimensional".to_string()));
        }
    };
    if values.len() != n * time_len {
        return Err(invalid(
            path,
            format!(
                "Qout holds {} values, expected {} reaches x {} time steps",
                values.len(),
                n,
                time_len
            ),
        ));
    }
    let flow = match dims.as_slice() {
        [(first, _), (_, time_len)] if first.eq_ignore_ascii_case("rivid") || first == "COMID" => {
            // Reach-major on disk; flip to time-major
            let mut flow = vec![0.0f32; values.len()];
            for r in 0..n {
                for t in 0..*time_len {
                    flow[t * n + r] = values[r * time_len + t];
                }
            }
            flow
        }
        _ => values,
    };

    Ok(Discharge {
        rivids,
        time_len,
        flow,
    })
}

fn station_columns(rivids: &[i64], stations: &[Station]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let by_id: HashMap<i64, &Station> = stations.iter().map(|s| (s.rivid, s)).collect();
    let mut lat = Vec::with_capacity(rivids.len());
    let mut lon = Vec::with_capacity(rivids.len());
    let mut z = Vec::with_capacity(rivids.len());
    for id in rivids {
        match by_id.get(id) {
            Some(s) => {
                lat.push(s.lat);
                lon.push(s.lon);
                z.push(s.z);
            }
            None => {
                lat.push(FILL_VALUE as f64);
                lon.push(FILL_VALUE as f64);
                z.push(FILL_VALUE as f64);
            }
        }
    }
    (lat, lon, z)
}

fn add_station_variables(
    file: &mut netcdf::FileMut,
    rivids: &[i64],
    stations: &[Station],
) -> PipelineResult<()> {
    let (lat, lon, z) = station_columns(rivids, stations);

    let mut rivid_var = file.add_variable::<i64>("rivid", &["rivid"])?;
    rivid_var.put_attribute("long_name", "unique identifier for each river reach")?;
    rivid_var.put_attribute("cf_role", "timeseries_id")?;
    rivid_var.put_values(rivids, ..)?;

    let mut lat_var = file.add_variable::<f64>("lat", &["rivid"])?;
    lat_var.put_attribute("_FillValue", FILL_VALUE as f64)?;
    lat_var.put_attribute("long_name", "latitude")?;
    lat_var.put_attribute("standard_name", "latitude")?;
    lat_var.put_attribute("units", "degrees_north")?;
    lat_var.put_attribute("axis", "Y")?;
    lat_var.put_values(&lat, ..)?;

    let mut lon_var = file.add_variable::<f64>("lon", &["rivid"])?;
    lon_var.put_attribute("_FillValue", FILL_VALUE as f64)?;
    lon_var.put_attribute("long_name", "longitude")?;
    lon_var.put_attribute("standard_name", "longitude")?;
    lon_var.put_attribute("units", "degrees_east")?;
    lon_var.put_attribute("axis", "X")?;
    lon_var.put_values(&lon, ..)?;

    let mut z_var = file.add_variable::<f64>("z", &["rivid"])?;
    z_var.put_attribute("_FillValue", FILL_VALUE as f64)?;
    z_var.put_attribute("long_name", "Elevation referenced to the North American Vertical Datum of 1988 (NAVD88)")?;
    z_var.put_attribute("standard_name", "surface_altitude")?;
    z_var.put_attribute("units", "m")?;
    z_var.put_attribute("positive", "up")?;
    z_var.put_values(&z, ..)?;

    Ok(())
}

/// Writes a CF-1.6 timeSeries discharge file. Time stamps mark the end of
/// each routing interval.
pub fn write_cf_discharge(
    path: &Path,
    discharge: &Discharge,
    stations: &[Station],
    start: &NaiveDateTime,
    step_seconds: u64,
    project_name: &str,
) -> PipelineResult<()> {
    let mut file = netcdf::create(path)?;

    file.add_dimension("time", discharge.time_len)?;
    file.add_dimension("rivid", discharge.rivids.len())?;

    let times: Vec<f64> = (1..=discharge.time_len)
        .map(|step| (step as u64 * step_seconds) as f64)
        .collect();
    let mut time_var = file.add_variable::<f64>("time", &["time"])?;
    time_var.put_attribute("long_name", "time")?;
    time_var.put_attribute("standard_name", "time")?;
    time_var.put_attribute(
        "units",
        format!("seconds since {}", start.format("%Y-%m-%d %H:%M:%S")),
    )?;
    time_var.put_attribute("axis", "T")?;
    time_var.put_attribute("calendar", "gregorian")?;
    time_var.put_values(&times, ..)?;

    add_station_variables(&mut file, &discharge.rivids, stations)?;

    let mut q_var = file.add_variable::<f32>(DISCHARGE_VARIABLE, &["time", "rivid"])?;
    q_var.put_attribute("_FillValue", FILL_VALUE)?;
    q_var.put_attribute("long_name", "Discharge")?;
    q_var.put_attribute("standard_name", "water_volume_transport_in_river_channel")?;
    q_var.put_attribute("units", "m3 s-1")?;
    q_var.put_attribute("coordinates", "time lat lon z")?;
    q_var.put_attribute("grid_mapping", "crs")?;
    q_var.put_attribute("cell_methods", "time: mean")?;
    q_var.put_values(&discharge.flow, ..)?;

    let mut crs_var = file.add_variable::<i32>("crs", &[])?;
    crs_var.put_attribute("grid_mapping_name", "latitude_longitude")?;
    crs_var.put_attribute("epsg_code", "EPSG:4326")?;
    crs_var.put_attribute("semi_major_axis", 6378137.0f64)?;
    crs_var.put_attribute("inverse_flattening", 298.257223563f64)?;

    file.add_attribute("Conventions", "CF-1.6")?;
    file.add_attribute("featureType", "timeSeries")?;
    file.add_attribute("title", format!("RAPID data corresponding to {}", project_name))?;
    file.add_attribute("institution", project_name)?;
    file.add_attribute(
        "history",
        format!(
            "date_created: {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        ),
    )?;
    file.add_attribute("time_coverage_start", start.format("%Y-%m-%dT%H:%M:%S").to_string())?;

    Ok(())
}

pub fn write_return_periods(
    path: &Path,
    periods: &ReturnPeriods,
    stations: &[Station],
) -> PipelineResult<()> {
    let mut file = netcdf::create(path)?;
    file.add_dimension("rivid", periods.rivids.len())?;

    add_station_variables(&mut file, &periods.rivids, stations)?;

    for (name, long_name, values) in [
        ("max_flow", "maximum streamflow", &periods.max_flow),
        ("return_period_20", "20 year return period flow", &periods.return_period_20),
        ("return_period_10", "10 year return period flow", &periods.return_period_10),
        ("return_period_2", "2 year return period flow", &periods.return_period_2),
    ] {
        let mut var = file.add_variable::<f64>(name, &["rivid"])?;
        var.put_attribute("long_name", long_name)?;
        var.put_attribute("units", "m3 s-1")?;
        var.put_values(values, ..)?;
    }

    file.add_attribute("Conventions", "CF-1.6")?;
    file.add_attribute("title", "Return periods estimated from annual maximum discharge")?;
    file.add_attribute("return_period_method", "Gumbel extreme value distribution")?;

    Ok(())
}
