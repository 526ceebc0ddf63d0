use crate::error::{PipelineError, PipelineResult};
use regex::RegexBuilder;
use std::fs;
use std::path::{Path, PathBuf};

/// Finds the single entry in `directory` whose name matches `pattern`
/// case-insensitively. More than one match is refused rather than guessed.
pub fn case_insensitive_file_search(directory: &Path, pattern: &str) -> PipelineResult<PathBuf> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| PipelineError::MissingRequiredFile {
            directory: directory.to_path_buf(),
            pattern: format!("{} (invalid pattern: {})", pattern, e),
        })?;

    let mut candidates: Vec<String> = fs::read_dir(directory)
        .map_err(|e| PipelineError::io(directory, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| regex.is_match(name))
        .collect();
    candidates.sort();

    match candidates.len() {
        0 => Err(PipelineError::MissingRequiredFile {
            directory: directory.to_path_buf(),
            pattern: pattern.to_string(),
        }),
        1 => Ok(directory.join(&candidates[0])),
        _ => Err(PipelineError::AmbiguousMatch {
            directory: directory.to_path_buf(),
            pattern: pattern.to_string(),
            candidates,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn matches_regardless_of_case() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("Weight_ERA_Interim.csv"), "").unwrap();
        fs::write(temp.path().join("rapid_connect.csv"), "").unwrap();

        let found = case_insensitive_file_search(temp.path(), r"weight_era_interim\.csv").unwrap();
        assert_eq!(found, temp.path().join("Weight_ERA_Interim.csv"));
    }

    #[test]
    fn missing_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let err = case_insensitive_file_search(temp.path(), r"riv_bas_id\.csv").unwrap_err();
        assert!(matches!(err, PipelineError::MissingRequiredFile { .. }));
    }

    #[test]
    fn several_matches_are_ambiguous() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("weight_era_interim.csv"), "").unwrap();
        fs::write(temp.path().join("old_weight_era_interim.csv"), "").unwrap();

        match case_insensitive_file_search(temp.path(), r"weight_era_interim\.csv") {
            Err(PipelineError::AmbiguousMatch { candidates, .. }) => {
                assert_eq!(
                    candidates,
                    vec!["old_weight_era_interim.csv", "weight_era_interim.csv"]
                );
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[test]
    fn anchored_patterns_do_not_catch_suffixes() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("K.csv"), "").unwrap();
        fs::write(temp.path().join("musk.csv"), "").unwrap();
        let found = case_insensitive_file_search(temp.path(), r"^k\.csv$").unwrap();
        assert_eq!(found, temp.path().join("K.csv"));
    }
}
