use std::fmt;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;

use crate::thermometry::calibration::larmor_frequency_mhz;

/// The dataset to analyze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum Dataset {
    /// Phantom scanned at 1.5 tesla
    #[value(name = "1.5T")]
    #[serde(rename = "1.5T")]
    T1_5,
    /// Phantom scanned at 3 tesla
    #[value(name = "3T")]
    #[serde(rename = "3T")]
    T3,
}

impl Dataset {
    /// Directory name under `data/`.
    pub fn label(self) -> &'static str {
        match self {
            Dataset::T1_5 => "1.5T",
            Dataset::T3 => "3T",
        }
    }

    /// Nominal main field in tesla.
    pub fn nominal_field_t(self) -> f64 {
        match self {
            Dataset::T1_5 => 1.5,
            Dataset::T3 => 3.0,
        }
    }

    /// Imaging frequency implied by the nominal field, MHz.
    pub fn nominal_frequency_mhz(self) -> f64 {
        larmor_frequency_mhz(self.nominal_field_t())
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The analysis method to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Fit the mean signal of each segmented region
    #[value(name = "regionwise")]
    Regionwise,
    /// Fit every segmented voxel and summarise per region
    #[value(name = "voxelwise")]
    Voxelwise,
    /// Regionwise fit with a bootstrap over each region's voxels
    #[value(name = "regionwise_bootstrap")]
    RegionwiseBootstrap,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Method::Regionwise => "regionwise",
            Method::Voxelwise => "voxelwise",
            Method::RegionwiseBootstrap => "regionwise_bootstrap",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run the ethylene glycol phantom thermometry analysis.
#[derive(Parser, Debug)]
#[command(name = "phantom-thermometry")]
#[command(about = "Run the ethylene glycol phantom thermometry analysis.", long_about = None)]
#[command(version)]
pub struct Cli {
    /// The dataset to analyze, either '1.5T' or '3T'.
    #[arg(value_enum)]
    pub dataset: Dataset,

    /// The analysis method to use.
    #[arg(short, long, value_enum, ignore_case = true, default_value_t = Method::Regionwise)]
    pub method: Method,

    /// Number of bootstrap resamples per region (regionwise_bootstrap only)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub bootstrap_iterations: Option<u32>,

    /// Project root containing the `data/` directory
    #[arg(long, env = "PHANTOM_THERMOMETRY_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Output directory (defaults to <project root>/results/<dataset>)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Configuration file (defaults to <data dir>/thermometry.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seed for bootstrap resampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Analyze only these runs (comma-separated)
    #[arg(long = "run", value_delimiter = ',')]
    pub runs: Vec<i64>,

    /// Skip the PNG slice renderings of the temperature maps
    #[arg(long)]
    pub no_images: bool,

    /// Increase verbosity level (can be repeated: -v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_dataset_and_method() {
        let cli = Cli::try_parse_from([
            "phantom-thermometry",
            "1.5T",
            "--method",
            "REGIONWISE_BOOTSTRAP",
            "--bootstrap-iterations",
            "250",
            "--run",
            "1,3",
        ])
        .unwrap();
        assert_eq!(cli.dataset, Dataset::T1_5);
        assert_eq!(cli.method, Method::RegionwiseBootstrap);
        assert_eq!(cli.bootstrap_iterations, Some(250));
        assert_eq!(cli.runs, vec![1, 3]);
    }

    #[test]
    fn method_defaults_to_regionwise() {
        let cli = Cli::try_parse_from(["phantom-thermometry", "3T"]).unwrap();
        assert_eq!(cli.method, Method::Regionwise);
        assert_eq!(cli.bootstrap_iterations, None);
        assert!(cli.runs.is_empty());
    }

    #[test]
    fn rejects_unknown_values() {
        assert!(Cli::try_parse_from(["phantom-thermometry", "7T"]).is_err());
        assert!(Cli::try_parse_from(["phantom-thermometry", "3T", "-m", "pixelwise"]).is_err());
        assert!(
            Cli::try_parse_from(["phantom-thermometry", "3T", "--bootstrap-iterations", "0"])
                .is_err()
        );
    }

    #[test]
    fn nominal_frequencies() {
        assert!((Dataset::T3.nominal_frequency_mhz() - 127.73).abs() < 0.01);
        assert!((Dataset::T1_5.nominal_frequency_mhz() - 63.87).abs() < 0.01);
        assert_eq!(Method::RegionwiseBootstrap.to_string(), "regionwise_bootstrap");
    }
}
