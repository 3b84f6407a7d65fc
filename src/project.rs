use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cli::Dataset;

/// Directory under the project root that holds one sub-directory per dataset.
pub const DATA_DIR_NAME: &str = "data";

/// Directory under the project root that receives results by default.
pub const RESULTS_DIR_NAME: &str = "results";

/// Nearest ancestor of `start` (inclusive) that contains a `data` directory,
/// or `start` itself when none does.
pub fn find_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(DATA_DIR_NAME).is_dir())
        .unwrap_or(start)
        .to_path_buf()
}

/// The explicit root if given, else the root found from the working directory.
pub fn resolve_project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(root) => Ok(root.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().context("reading the current directory")?;
            Ok(find_project_root(&cwd))
        }
    }
}

/// `<root>/data/<dataset>`
pub fn dataset_dir(root: &Path, dataset: Dataset) -> PathBuf {
    root.join(DATA_DIR_NAME).join(dataset.label())
}

/// `<root>/results/<dataset>`
pub fn default_output_dir(root: &Path, dataset: Dataset) -> PathBuf {
    root.join(RESULTS_DIR_NAME).join(dataset.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walks_up_to_the_directory_holding_data() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("data/3T")).unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_project_root(&nested), root.path());
    }

    #[test]
    fn falls_back_to_start_without_data_directory() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("x");
        std::fs::create_dir_all(&nested).unwrap();
        // Some ancestor of the temp dir could hold a data/ directory; only
        // assert when none does.
        if !root.path().ancestors().any(|d| d.join(DATA_DIR_NAME).is_dir()) {
            assert_eq!(find_project_root(&nested), nested);
        }
    }

    #[test]
    fn dataset_paths_use_the_selector_literally() {
        let root = Path::new("/proj");
        assert_eq!(dataset_dir(root, Dataset::T1_5), Path::new("/proj/data/1.5T"));
        assert_eq!(default_output_dir(root, Dataset::T3), Path::new("/proj/results/3T"));
        assert_eq!(
            resolve_project_root(Some(root)).unwrap(),
            PathBuf::from("/proj")
        );
    }
}
