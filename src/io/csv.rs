use crate::error::{PipelineError, PipelineResult};
use crate::network::ConnectRow;
use csv::{Reader, ReaderBuilder, StringRecord};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

// Reach location used to annotate discharge outputs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Station {
    pub rivid: i64,
    pub lat: f64,
    pub lon: f64,
    pub z: f64,
}

fn open_reader(path: &Path, has_headers: bool) -> PipelineResult<Reader<BufReader<File>>> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let buffered_reader = BufReader::new(file);

    Ok(ReaderBuilder::new()
        .has_headers(has_headers)
        .delimiter(b',')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(buffered_reader))
}

fn header_index(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
}

fn field<'a>(record: &'a StringRecord, index: usize) -> Option<&'a str> {
    record.get(index).filter(|s| !s.is_empty())
}

// Identifiers are sometimes written as floats ("1234.0")
fn parse_id(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

/// Reads `(reach_id, area_sqm, lat_index, lon_index)` rows from a weight
/// table. The reach id is the first column; the others are found by header.
pub fn read_weight_rows(path: &Path) -> PipelineResult<Vec<(i64, f64, i64, i64)>> {
    let invalid = |reason: String| PipelineError::InvalidWeightTable {
        path: path.to_path_buf(),
        reason,
    };

    let mut rdr = open_reader(path, true)?;
    let headers = rdr.headers()?.clone();
    let area_idx = header_index(&headers, &["area_sqm"])
        .ok_or_else(|| invalid("missing area_sqm column".to_string()))?;
    let lat_idx = header_index(&headers, &["lat_index"])
        .ok_or_else(|| invalid("missing lat_index column".to_string()))?;
    let lon_idx = header_index(&headers, &["lon_index"])
        .ok_or_else(|| invalid("missing lon_index column".to_string()))?;

    let mut rows = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let parsed = (|| {
            let reach_id = parse_id(field(&record, 0)?)?;
            let area = field(&record, area_idx)?.parse::<f64>().ok()?;
            let lat = parse_id(field(&record, lat_idx)?)?;
            let lon = parse_id(field(&record, lon_idx)?)?;
            Some((reach_id, area, lat, lon))
        })();
        match parsed {
            Some(row) => rows.push(row),
            None => return Err(invalid(format!("malformed row {}", line + 2))),
        }
    }
    Ok(rows)
}

/// Reads a headerless connectivity file: `id, downstream_id, n_upstream, up_1, ...`.
pub fn read_connectivity(path: &Path) -> PipelineResult<Vec<ConnectRow>> {
    let mut rdr = open_reader(path, false)?;
    let mut rows = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let invalid = || PipelineError::InvalidNetwork {
            path: path.to_path_buf(),
            reason: format!("malformed row {}", line + 1),
        };
        let id = field(&record, 0).and_then(parse_id).ok_or_else(invalid)?;
        let downstream = field(&record, 1).and_then(parse_id).ok_or_else(invalid)?;
        let n_upstream = field(&record, 2)
            .and_then(parse_id)
            .map(|n| n.max(0) as usize)
            .unwrap_or(0);
        let upstream = (0..n_upstream)
            .filter_map(|i| field(&record, 3 + i).and_then(parse_id))
            .filter(|&up| up != 0)
            .collect();
        rows.push(ConnectRow {
            id,
            downstream: if downstream == 0 { None } else { Some(downstream) },
            upstream,
        });
    }
    Ok(rows)
}

/// Reads a headerless single-column list of reach ids.
pub fn read_reach_ids(path: &Path) -> PipelineResult<Vec<i64>> {
    let mut rdr = open_reader(path, false)?;
    let mut ids = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let id = field(&record, 0)
            .and_then(parse_id)
            .ok_or_else(|| PipelineError::InvalidNetwork {
                path: path.to_path_buf(),
                reason: format!("malformed reach id on line {}", line + 1),
            })?;
        ids.push(id);
    }
    Ok(ids)
}

/// Reads station metadata with a `rivid|comid, lat, lon, z` header.
pub fn read_stations(path: &Path) -> PipelineResult<Vec<Station>> {
    let invalid = |reason: String| PipelineError::Normalization(format!(
        "{}: {}",
        path.display(),
        reason
    ));

    let mut rdr = open_reader(path, true)?;
    let headers = rdr.headers()?.clone();
    let id_idx = header_index(&headers, &["rivid", "comid"]).unwrap_or(0);
    let lat_idx =
        header_index(&headers, &["lat"]).ok_or_else(|| invalid("missing lat column".into()))?;
    let lon_idx =
        header_index(&headers, &["lon"]).ok_or_else(|| invalid("missing lon column".into()))?;
    let z_idx = header_index(&headers, &["z", "elevation"]);

    let mut stations = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let parsed = (|| {
            Some(Station {
                rivid: parse_id(field(&record, id_idx)?)?,
                lat: field(&record, lat_idx)?.parse().ok()?,
                lon: field(&record, lon_idx)?.parse().ok()?,
                z: match z_idx {
                    Some(i) => field(&record, i)?.parse().ok()?,
                    None => 0.0,
                },
            })
        })();
        stations.push(parsed.ok_or_else(|| invalid(format!("malformed row {}", line + 2)))?);
    }
    Ok(stations)
}
