use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::{Dataset, Method};
use crate::data::model::MetadataValue;
use crate::thermometry::calibration::Calibration;
use crate::thermometry::methods::RegionEstimate;

/// Name of the analysis-wide JSON summary.
pub const SUMMARY_FILE_NAME: &str = "thermometry_summary.json";

/// `run-RR_thermometry`
pub fn output_prefix(run: i64) -> String {
    format!("run-{run:02}_thermometry")
}

/// `run-RR_series-SSS_te_s.txt`
pub fn echo_times_file_name(run: i64, series_no: i64) -> String {
    format!("run-{run:02}_series-{series_no:03}_te_s.txt")
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// One line of `<prefix>_regions.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRow {
    pub run: i64,
    pub label: i64,
    pub n_voxels: usize,
    pub method: &'static str,
    pub temperature_c: Option<f64>,
    pub mean_c: Option<f64>,
    pub std_c: Option<f64>,
    pub median_c: Option<f64>,
    pub ci_low_c: Option<f64>,
    pub ci_high_c: Option<f64>,
    pub n_samples: Option<usize>,
    pub delta_f_hz: Option<f64>,
    pub delta_ppm: Option<f64>,
    pub r2star_per_s: Option<f64>,
    pub r_squared: Option<f64>,
}

impl RegionRow {
    pub fn new(run: i64, method: Method, e: &RegionEstimate) -> Self {
        RegionRow {
            run,
            label: e.label,
            n_voxels: e.n_voxels,
            method: method.name(),
            temperature_c: e.temperature_c,
            mean_c: e.mean_c,
            std_c: e.std_c,
            median_c: e.median_c,
            ci_low_c: e.ci_low_c,
            ci_high_c: e.ci_high_c,
            n_samples: e.n_samples,
            delta_f_hz: e.delta_f_hz,
            delta_ppm: e.delta_ppm,
            r2star_per_s: e.r2star_per_s,
            r_squared: e.r_squared,
        }
    }
}

/// A series that entered a run's echo stack.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSummary {
    pub series_no: i64,
    pub study_id: String,
    pub te_ms: Vec<f64>,
    pub nifti_file: PathBuf,
    pub te_file: PathBuf,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// Where a run's imaging frequency came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencySource {
    SidecarImagingFrequency,
    SidecarFieldStrength,
    NominalFieldStrength,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: i64,
    pub imaging_frequency_mhz: f64,
    pub frequency_source: FrequencySource,
    pub echo_times_s: Vec<f64>,
    pub series: Vec<SeriesSummary>,
    pub regions: Vec<RegionRow>,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub dataset: Dataset,
    pub method: Method,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub config_file: Option<PathBuf>,
    /// Series table columns beyond the required ones.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata_columns: Vec<String>,
    pub calibration: Calibration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_iterations: Option<u32>,
    pub seed: u64,
    pub runs: Vec<RunReport>,
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Echo times, one value per line.
pub fn write_echo_times(path: &Path, te_s: &[f64]) -> Result<()> {
    let mut text = String::with_capacity(te_s.len() * 8);
    for te in te_s {
        let _ = writeln!(text, "{te}");
    }
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

pub fn write_region_csv(path: &Path, rows: &[RegionRow]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))
}

pub fn write_summary_json(path: &Path, report: &AnalysisReport) -> Result<()> {
    let text = serde_json::to_string_pretty(report).context("serialising summary")?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Console table
// ---------------------------------------------------------------------------

fn cell(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{v:.precision$}"),
        None => "-".to_string(),
    }
}

/// Plain-text results table for the terminal.
pub fn format_table(report: &AnalysisReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Dataset {}  method {}  ({} run(s))",
        report.dataset,
        report.method,
        report.runs.len()
    );
    let _ = writeln!(
        out,
        "{:>4} {:>6} {:>7} {:>9} {:>7} {:>17} {:>8} {:>7}",
        "run", "label", "voxels", "T (°C)", "SD", "95% CI", "Δf (Hz)", "R²"
    );
    for run in &report.runs {
        for row in &run.regions {
            let ci = match (row.ci_low_c, row.ci_high_c) {
                (Some(lo), Some(hi)) => format!("[{lo:.2}, {hi:.2}]"),
                _ => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "{:>4} {:>6} {:>7} {:>9} {:>7} {:>17} {:>8} {:>7}",
                row.run,
                row.label,
                row.n_voxels,
                cell(row.temperature_c, 2),
                cell(row.std_c, 2),
                ci,
                cell(row.delta_f_hz, 1),
                cell(row.r_squared, 3),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(label: i64) -> RegionRow {
        RegionRow::new(
            1,
            Method::RegionwiseBootstrap,
            &RegionEstimate {
                label,
                n_voxels: 12,
                temperature_c: Some(21.5),
                std_c: Some(0.25),
                ci_low_c: Some(21.0),
                ci_high_c: Some(22.0),
                n_samples: Some(100),
                ..Default::default()
            },
        )
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(output_prefix(3), "run-03_thermometry");
        assert_eq!(echo_times_file_name(1, 7), "run-01_series-007_te_s.txt");
    }

    #[test]
    fn echo_times_file_has_one_value_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("te.txt");
        write_echo_times(&path, &[0.002, 0.0045]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0.002\n0.0045\n");
    }

    #[test]
    fn csv_leaves_missing_columns_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("regions.csv");
        write_region_csv(&path, &[row(1), row(2)]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("run,label,n_voxels,method,temperature_c,mean_c"));
        assert_eq!(
            lines.next().unwrap(),
            "1,1,12,regionwise_bootstrap,21.5,,0.25,,21.0,22.0,100,,,,"
        );
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn table_lists_every_region() {
        let report = AnalysisReport {
            dataset: Dataset::T3,
            method: Method::RegionwiseBootstrap,
            data_dir: PathBuf::from("data/3T"),
            output_dir: PathBuf::from("results/3T"),
            config_file: None,
            metadata_columns: vec!["flip_angle_deg".into()],
            calibration: Calibration::default(),
            bootstrap_iterations: Some(100),
            seed: 42,
            runs: vec![RunReport {
                run: 1,
                imaging_frequency_mhz: 127.7,
                frequency_source: FrequencySource::NominalFieldStrength,
                echo_times_s: vec![],
                series: vec![],
                regions: vec![row(1), row(2)],
                outputs: vec![],
            }],
        };
        let table = format_table(&report);
        assert_eq!(table.lines().count(), 4);
        assert!(table.contains("[21.00, 22.00]"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dataset"], "3T");
        assert_eq!(json["metadata_columns"][0], "flip_angle_deg");
        assert_eq!(json["method"], "regionwise_bootstrap");
        assert_eq!(json["runs"][0]["frequency_source"], "nominal_field_strength");
    }
}
