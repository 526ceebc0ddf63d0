use crate::error::{PipelineError, PipelineResult};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const NAME_SEPARATOR: char = '-';

// A watershed/subbasin pair discovered from `input/<WATERSHED>-<SUBBASIN>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watershed {
    pub watershed: String,
    pub subbasin: String,
    pub directory_name: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl fmt::Display for Watershed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.watershed, self.subbasin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotADirectory,
    MalformedName,
    Unreadable(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotADirectory => f.write_str("not a directory"),
            RejectReason::MalformedName => write!(
                f,
                "name is not <watershed>{}<subbasin>",
                NAME_SEPARATOR
            ),
            RejectReason::Unreadable(e) => write!(f, "unreadable entry: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub name: String,
    pub reason: RejectReason,
}

#[derive(Debug, Default)]
pub struct Catalog {
    pub watersheds: Vec<Watershed>,
    pub rejected: Vec<Rejection>,
}

/// Splits a directory name into lower-cased (watershed, subbasin).
pub fn parse_directory_name(name: &str) -> Option<(String, String)> {
    let mut parts = name.split(NAME_SEPARATOR);
    let watershed = parts.next()?;
    let subbasin = parts.next()?;
    if parts.next().is_some() || watershed.is_empty() || subbasin.is_empty() {
        return None;
    }
    Some((watershed.to_lowercase(), subbasin.to_lowercase()))
}

/// Scans the immediate children of `input_root`. Malformed entries are
/// recorded and skipped; an empty catalog is a valid (empty) batch.
pub fn discover_watersheds(input_root: &Path, output_root: &Path) -> PipelineResult<Catalog> {
    if !input_root.is_dir() {
        return Err(PipelineError::MissingInputRoot(input_root.to_path_buf()));
    }

    let mut entries: Vec<_> = fs::read_dir(input_root)
        .map_err(|e| PipelineError::io(input_root, e))?
        .collect();
    // read_dir order is filesystem dependent
    entries.sort_by_key(|entry| entry.as_ref().map(|e| e.file_name()).ok());

    let mut catalog = Catalog::default();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry in {}: {}", input_root.display(), e);
                catalog.rejected.push(Rejection {
                    name: String::from("<unreadable>"),
                    reason: RejectReason::Unreadable(e.to_string()),
                });
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        let reason = if !path.is_dir() {
            Some(RejectReason::NotADirectory)
        } else if parse_directory_name(&name).is_none() {
            Some(RejectReason::MalformedName)
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!("{} incorrectly formatted ({}). Skipping ...", name, reason);
            catalog.rejected.push(Rejection { name, reason });
            continue;
        }

        if let Some((watershed, subbasin)) = parse_directory_name(&name) {
            catalog.watersheds.push(Watershed {
                watershed,
                subbasin,
                output_dir: output_root.join(&name),
                input_dir: path,
                directory_name: name,
            });
        }
    }

    info!(
        "Found {} watershed directories ({} rejected)",
        catalog.watersheds.len(),
        catalog.rejected.len()
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accepts_exactly_two_tokens() {
        assert_eq!(
            parse_directory_name("NAMIBIA-1"),
            Some(("namibia".to_string(), "1".to_string()))
        );
        assert_eq!(
            parse_directory_name("Nile-Upper"),
            Some(("nile".to_string(), "upper".to_string()))
        );
    }

    #[test]
    fn rejects_other_shapes() {
        for name in ["namibia", "a-b-c", "-1", "namibia-", "-", ""] {
            assert_eq!(parse_directory_name(name), None, "{:?}", name);
        }
    }

    #[test]
    fn discovery_skips_malformed_entries() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("input");
        fs::create_dir_all(input.join("NAMIBIA-1")).unwrap();
        fs::create_dir_all(input.join("congo-2")).unwrap();
        fs::create_dir_all(input.join("bad_name")).unwrap();
        fs::create_dir_all(input.join("too-many-parts")).unwrap();
        fs::write(input.join("stray-file"), "x").unwrap();

        let catalog = discover_watersheds(&input, &temp.path().join("output")).unwrap();

        let names: Vec<_> = catalog.watersheds.iter().map(|w| w.to_string()).collect();
        assert_eq!(names, vec!["namibia-1", "congo-2"]);
        assert_eq!(
            catalog.watersheds[0].output_dir,
            temp.path().join("output").join("NAMIBIA-1")
        );

        assert_eq!(catalog.rejected.len(), 3);
        let stray = catalog
            .rejected
            .iter()
            .find(|r| r.name == "stray-file")
            .unwrap();
        assert_eq!(stray.reason, RejectReason::NotADirectory);
    }

    #[test]
    fn empty_root_is_an_empty_batch() {
        let temp = TempDir::new().unwrap();
        let catalog = discover_watersheds(temp.path(), temp.path()).unwrap();
        assert!(catalog.watersheds.is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = discover_watersheds(&temp.path().join("nope"), temp.path()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInputRoot(_)));
    }
}
