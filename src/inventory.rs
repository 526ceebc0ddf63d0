use crate::error::{PipelineError, PipelineResult};
use chrono::NaiveDate;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static DATE_IN_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d{8})").ok());

/// Extracts a chronological key from a runoff file path.
pub type TimeKey = fn(&Path) -> Option<NaiveDate>;

/// Default key: the first `YYYYMMDD` run of digits in the file name that is
/// a real calendar date.
pub fn date_from_file_name(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    DATE_IN_NAME
        .as_ref()?
        .captures_iter(name)
        .filter_map(|c| NaiveDate::parse_from_str(&c[1], "%Y%m%d").ok())
        .next()
}

/// Ordered runoff files for one processing run. Position in `files` is the
/// time index each file is downscaled into.
#[derive(Debug, Clone)]
pub struct RunoffInventory {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl RunoffInventory {
    /// Recursively collects files ending in `.{extension}` under `root`,
    /// sorted by full path. Sort order is assumed to be chronological; use
    /// [`RunoffInventory::validate_chronology`] to check that assumption.
    pub fn collect(root: &Path, extension: &str) -> PipelineResult<Self> {
        let mut files = Vec::new();
        walk(root, extension, &mut files)?;
        files.sort();

        if files.is_empty() {
            return Err(PipelineError::EmptyInventory {
                root: root.to_path_buf(),
                extension: extension.to_string(),
            });
        }

        info!("Found {} runoff files under {}", files.len(), root.display());
        Ok(RunoffInventory {
            root: root.to_path_buf(),
            files,
        })
    }

    /// Checks that the lexicographic order matches `key` order. Files the
    /// key cannot date are reported and excluded from the check.
    pub fn validate_chronology(&self, key: TimeKey) -> PipelineResult<()> {
        let mut previous: Option<(NaiveDate, &PathBuf)> = None;
        let mut undated = 0usize;
        for file in &self.files {
            let Some(date) = key(file) else {
                undated += 1;
                debug!("no time key in {}", file.display());
                continue;
            };
            if let Some((prev_date, prev_file)) = previous {
                if date <= prev_date {
                    return Err(PipelineError::NonMonotonicInventory {
                        previous: prev_file.clone(),
                        next: file.clone(),
                    });
                }
            }
            previous = Some((date, file));
        }
        if undated > 0 {
            warn!(
                "{} of {} runoff files carry no date in their name; their order is unchecked",
                undated,
                self.files.len()
            );
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

// Directory symlinks are not followed, so a link back up the tree cannot
// repeat files. Symlinked files are kept.
fn walk(dir: &Path, extension: &str, files: &mut Vec<PathBuf>) -> PipelineResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| PipelineError::io(&path, e))?;
        if file_type.is_dir() {
            walk(&path, extension, files)?;
        } else if file_type.is_symlink() && path.is_dir() {
            debug!("not following directory link {}", path.display());
        } else if path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn collects_recursively_in_path_order() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(&root.join("1981/Runoff.19810101.nc"));
        touch(&root.join("1980/Runoff.19801231.nc"));
        touch(&root.join("1980/Runoff.19800101.nc"));
        touch(&root.join("1980/readme.txt"));

        let inventory = RunoffInventory::collect(root, "nc").unwrap();
        let names: Vec<_> = inventory
            .files()
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "1980/Runoff.19800101.nc",
                "1980/Runoff.19801231.nc",
                "1981/Runoff.19810101.nc"
            ]
        );
        inventory.validate_chronology(date_from_file_name).unwrap();
    }

    #[test]
    fn no_runoff_files_is_empty_inventory() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("notes.txt"));
        let err = RunoffInventory::collect(temp.path(), "nc").unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInventory { .. }));
    }

    #[test]
    fn detects_names_that_sort_out_of_time_order() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("a_19800102.nc"));
        touch(&temp.path().join("b_19800101.nc"));
        let inventory = RunoffInventory::collect(temp.path(), "nc").unwrap();
        let err = inventory
            .validate_chronology(date_from_file_name)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NonMonotonicInventory { .. }));
    }

    #[test]
    fn undated_files_are_not_an_error() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("runoff_a.nc"));
        touch(&temp.path().join("runoff_b.nc"));
        let inventory = RunoffInventory::collect(temp.path(), "nc").unwrap();
        assert!(inventory.validate_chronology(date_from_file_name).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn directory_links_are_not_followed() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().unwrap();
        let root = temp.path().join("erai");
        touch(&root.join("1980/Runoff.19800101.nc"));
        symlink(&root, root.join("1980/loop")).unwrap();

        let inventory = RunoffInventory::collect(&root, "nc").unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory.files()[0], root.join("1980/Runoff.19800101.nc"));
    }

    #[cfg(unix)]
    #[test]
    fn linked_runoff_files_are_kept() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("archive/Runoff.19800101.nc");
        touch(&archive);
        let root = temp.path().join("erai");
        fs::create_dir_all(&root).unwrap();
        symlink(&archive, root.join("Runoff.19800101.nc")).unwrap();

        let inventory = RunoffInventory::collect(&root, "nc").unwrap();
        assert_eq!(inventory.len(), 1);
    }

    #[test]
    fn date_key_skips_invalid_digit_runs() {
        let key = date_from_file_name(Path::new("/x/erai_99999999_19800215.nc"));
        assert_eq!(key, NaiveDate::from_ymd_opt(1980, 2, 15));
    }
}
