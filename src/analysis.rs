use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::cli::{Dataset, Method};
use crate::color::{TemperatureColorMap, write_slices};
use crate::config::ThermometryConfig;
use crate::data::loader::{find_series_table, load_bids_sidecars, load_series_table};
use crate::data::model::{BidsSidecar, SeriesRecord};
use crate::data::nifti::{Volume, read_volume, write_volume};
use crate::data::selection::{attach_nifti_files, find_sidecar, group_by_run, select_runs};
use crate::error::ThermometryError;
use crate::report::{
    AnalysisReport, FrequencySource, RegionRow, RunReport, SUMMARY_FILE_NAME, SeriesSummary,
    echo_times_file_name, output_prefix, write_echo_times, write_region_csv, write_summary_json,
};
use crate::thermometry::calibration::larmor_frequency_mhz;
use crate::thermometry::echo::{EchoStack, SeriesImage};
use crate::thermometry::fit::MIN_ECHOES;
use crate::thermometry::methods::{BootstrapSettings, FitContext, run_method};
use crate::thermometry::regions::{Region, regions_from_segmentation};

/// Segmentation file names, in lookup order.
pub const SEGMENTATION_FILE_NAMES: [&str; 2] = ["segmentation.nii.gz", "segmentation.nii"];

/// One fully resolved invocation of the analysis.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub dataset: Dataset,
    pub method: Method,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Effective configuration, command-line overrides already applied.
    pub config: ThermometryConfig,
    pub config_file: Option<PathBuf>,
    /// Runs to analyze; empty means all.
    pub runs: Vec<i64>,
    pub write_images: bool,
}

// ---------------------------------------------------------------------------
// Dataset inputs
// ---------------------------------------------------------------------------

/// Locate the segmentation image of a dataset.
pub fn find_segmentation(data_dir: &Path) -> Result<PathBuf, ThermometryError> {
    SEGMENTATION_FILE_NAMES
        .iter()
        .map(|name| data_dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| ThermometryError::SegmentationNotFound(data_dir.join(SEGMENTATION_FILE_NAMES[0])))
}

/// Regions of the segmentation with at least `min_voxels` voxels.
pub fn usable_regions(segmentation: &Volume, min_voxels: usize) -> Vec<Region> {
    regions_from_segmentation(segmentation)
        .into_iter()
        .filter(|region| {
            let keep = region.len() >= min_voxels;
            if !keep {
                warn!(
                    "Skipping region {}: {} voxel(s), fewer than {min_voxels}",
                    region.label,
                    region.len()
                );
            }
            keep
        })
        .collect()
}

/// Imaging frequency of a run and where it came from.
pub fn imaging_frequency(
    records: &[&SeriesRecord],
    sidecars: &[BidsSidecar],
    dataset: Dataset,
) -> (f64, FrequencySource) {
    let run_sidecars: Vec<&BidsSidecar> = records
        .iter()
        .filter_map(|record| find_sidecar(record, sidecars))
        .collect();

    if let Some(f0) = run_sidecars.iter().find_map(|sc| sc.imaging_frequency_mhz()) {
        return (f0, FrequencySource::SidecarImagingFrequency);
    }
    if let Some(b0) = run_sidecars.iter().find_map(|sc| sc.field_strength_t()) {
        return (larmor_frequency_mhz(b0), FrequencySource::SidecarFieldStrength);
    }
    (dataset.nominal_frequency_mhz(), FrequencySource::NominalFieldStrength)
}

fn load_series_image(record: &SeriesRecord, path: &Path) -> Result<SeriesImage> {
    let volume = read_volume(path)
        .with_context(|| format!("reading series {} image", record.series_no))?;
    debug!(
        "Series {}: {:?} voxels × {} echo(es) from {}",
        record.series_no,
        volume.grid(),
        volume.frames(),
        path.display()
    );
    Ok(SeriesImage {
        series_no: record.series_no,
        te_s: record.te_seconds(),
        volume,
    })
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Run the configured method over every selected run of a dataset and write
/// all outputs. The returned report is also saved as
/// `thermometry_summary.json`.
pub fn run_analysis(request: &AnalysisRequest) -> Result<AnalysisReport> {
    let data_dir = &request.data_dir;
    if !data_dir.is_dir() {
        return Err(ThermometryError::DataDirNotFound(data_dir.clone()).into());
    }

    let table_path = find_series_table(data_dir)?;
    let mut table = load_series_table(&table_path)?;
    if table.is_empty() {
        warn!("Series table {} has no rows", table_path.display());
    } else {
        info!("Loaded {} series from {}", table.len(), table_path.display());
    }

    let sidecars = load_bids_sidecars(data_dir)?;
    debug!("Found {} sidecar(s)", sidecars.len());
    let unmatched = attach_nifti_files(&mut table, &sidecars);
    if unmatched > 0 {
        warn!("{unmatched} series without a matching sidecar are excluded");
    }

    let segmentation_path = find_segmentation(data_dir)?;
    let segmentation = read_volume(&segmentation_path).context("reading segmentation")?;
    let regions = usable_regions(&segmentation, request.config.analysis.min_region_voxels);
    info!(
        "Segmentation {}: {} region(s) on grid {:?}",
        segmentation_path.display(),
        regions.len(),
        segmentation.grid()
    );

    let runs = select_runs(group_by_run(&table), &request.runs)?;

    fs::create_dir_all(&request.output_dir)
        .with_context(|| format!("creating {}", request.output_dir.display()))?;

    let mut run_reports = Vec::with_capacity(runs.len());
    for (run, records) in &runs {
        if let Some(report) =
            analyse_run(request, *run, records, &sidecars, &segmentation, &regions)?
        {
            run_reports.push(report);
        }
    }

    let bootstrap_iterations = (request.method == Method::RegionwiseBootstrap)
        .then_some(request.config.analysis.bootstrap_iterations);
    let report = AnalysisReport {
        dataset: request.dataset,
        method: request.method,
        data_dir: data_dir.clone(),
        output_dir: request.output_dir.clone(),
        config_file: request.config_file.clone(),
        metadata_columns: table.extra_columns.clone(),
        calibration: request.config.calibration,
        bootstrap_iterations,
        seed: request.config.analysis.seed,
        runs: run_reports,
    };
    let summary_path = request.output_dir.join(SUMMARY_FILE_NAME);
    write_summary_json(&summary_path, &report)?;
    info!("Summary written to {}", summary_path.display());
    Ok(report)
}

fn analyse_run(
    request: &AnalysisRequest,
    run: i64,
    records: &[&SeriesRecord],
    sidecars: &[BidsSidecar],
    segmentation: &Volume,
    regions: &[Region],
) -> Result<Option<RunReport>> {
    let out_dir = &request.output_dir;
    let matched: Vec<(&SeriesRecord, &PathBuf)> = records
        .iter()
        .filter_map(|r| r.nifti_file.as_ref().map(|path| (*r, path)))
        .collect();
    if matched.is_empty() {
        warn!("Run {run}: no series with an image, skipping");
        return Ok(None);
    }
    info!("Run {run}: {} series", matched.len());

    let mut series = Vec::with_capacity(matched.len());
    let mut images = Vec::with_capacity(matched.len());
    for (record, path) in &matched {
        let te_file = out_dir.join(echo_times_file_name(run, record.series_no));
        write_echo_times(&te_file, &record.te_seconds())?;
        images.push(load_series_image(record, path)?);
        series.push(SeriesSummary {
            series_no: record.series_no,
            study_id: record.study_id.clone(),
            te_ms: record.te_ms.clone(),
            nifti_file: (*path).clone(),
            te_file,
            metadata: record.metadata.clone(),
        });
    }

    let stack = EchoStack::assemble(images, segmentation.grid())
        .with_context(|| format!("assembling echoes of run {run}"))?;
    if stack.echo_count() < MIN_ECHOES {
        warn!(
            "Run {run}: {}, skipping",
            ThermometryError::InsufficientEchoes {
                required: MIN_ECHOES,
                found: stack.echo_count(),
            }
        );
        return Ok(None);
    }

    let (f0_mhz, frequency_source) = imaging_frequency(records, sidecars, request.dataset);
    let config = &request.config;
    debug!(
        "Run {run}: series {:?}, f0 = {f0_mhz:.4} MHz ({frequency_source:?}), {} echoes, grid step {:.4} ppm",
        stack.series_numbers(),
        stack.echo_count(),
        config.frequency_step_ppm(f0_mhz)
    );

    let ctx = FitContext::new(config, f0_mhz);
    let bootstrap = BootstrapSettings {
        iterations: config.analysis.bootstrap_iterations,
        seed: config.analysis.seed,
    };
    let output = run_method(request.method, &stack, regions, &ctx, bootstrap);

    let prefix = output_prefix(run);
    let rows: Vec<RegionRow> = output
        .estimates
        .iter()
        .map(|e| RegionRow::new(run, request.method, e))
        .collect();
    let mut outputs = Vec::new();

    let csv_path = out_dir.join(format!("{prefix}_regions.csv"));
    write_region_csv(&csv_path, &rows)?;
    outputs.push(csv_path);

    let grid = segmentation.grid();
    let map_volume = Volume {
        dims: [grid[0], grid[1], grid[2], 1],
        geometry: segmentation.geometry.clone(),
        data: output.temperature_map,
    };
    let map_path = out_dir.join(format!("{prefix}_temperature.nii.gz"));
    write_volume(&map_path, &map_volume, "temperature (degC)")?;
    outputs.push(map_path);

    if request.write_images {
        let cmap = TemperatureColorMap::new(config.output.display_min_c, config.output.display_max_c);
        outputs.extend(write_slices(out_dir, &prefix, &map_volume.data, grid, &cmap)?);
    }
    info!("Run {run}: {} region(s) written to {}", rows.len(), out_dir.display());

    Ok(Some(RunReport {
        run,
        imaging_frequency_mhz: f0_mhz,
        frequency_source,
        echo_times_s: stack.echo_times(),
        series,
        regions: rows,
        outputs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::nifti::Geometry;
    use serde_json::json;

    fn sidecar(name: &str, fields: serde_json::Value) -> BidsSidecar {
        let map = fields.as_object().cloned().unwrap_or_default();
        BidsSidecar::from_fields(PathBuf::from(name), map)
    }

    fn record(series_no: i64) -> SeriesRecord {
        SeriesRecord {
            patient_name: "phantom".into(),
            study_id: "1.2.3".into(),
            series_no,
            run: 1,
            te_ms: vec![2.0, 4.0],
            nifti_file: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn imaging_frequency_prefers_sidecar_values() {
        let r1 = record(1);
        let r2 = record(2);
        let records = vec![&r1, &r2];

        let sidecars = vec![
            sidecar("a.json", json!({"StudyInstanceUID": "1.2.3", "SeriesNumber": 1, "MagneticFieldStrength": 3})),
            sidecar("b.json", json!({"StudyInstanceUID": "1.2.3", "SeriesNumber": 2, "ImagingFrequency": 123.25})),
        ];
        assert_eq!(
            imaging_frequency(&records, &sidecars, Dataset::T1_5),
            (123.25, FrequencySource::SidecarImagingFrequency)
        );

        let (f0, source) = imaging_frequency(&records, &sidecars[..1], Dataset::T1_5);
        assert_eq!(source, FrequencySource::SidecarFieldStrength);
        assert!((f0 - 3.0 * 42.577478).abs() < 1e-9);

        let (f0, source) = imaging_frequency(&records, &[], Dataset::T1_5);
        assert_eq!(source, FrequencySource::NominalFieldStrength);
        assert!((f0 - Dataset::T1_5.nominal_frequency_mhz()).abs() < 1e-12);
    }

    #[test]
    fn small_regions_are_skipped() {
        let mut seg = Volume::filled([3, 2, 1, 1], Geometry::default(), 0.0);
        seg.data = vec![1.0, 1.0, 2.0, 1.0, 0.0, 0.0];
        let regions = usable_regions(&seg, 2);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].label, 1);
        assert_eq!(regions[0].voxels, vec![0, 1, 3]);
    }

    #[test]
    fn run_with_short_echo_train_is_skipped() {
        use crate::synthetic::{PhantomSpec, TableFormat, write_phantom_dataset};
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let dir = tempfile::TempDir::new().unwrap();
        let data_dir = dir.path().join("3T");
        let spec = PhantomSpec::default_for(Dataset::T3);
        write_phantom_dataset(&data_dir, &spec, 3, TableFormat::Csv).unwrap();

        // Run 2 keeps only its first series, cut down to three echoes.
        let short_train = [1.6, 4.0, 6.4];
        let volume = spec.series_volume(
            &spec.runs[1].temperatures_c,
            &short_train,
            &mut StdRng::seed_from_u64(1),
        );
        write_volume(
            &data_dir.join("sub-phantom_run-02_acq-train1_MEGRE.nii.gz"),
            &volume,
            "short train",
        )
        .unwrap();
        for train in [2, 3] {
            fs::remove_file(data_dir.join(format!("sub-phantom_run-02_acq-train{train}_MEGRE.json")))
                .unwrap();
        }
        let table_path = data_dir.join("image_information.csv");
        let mut reader = csv::Reader::from_path(&table_path).unwrap();
        let header = reader.headers().unwrap().clone();
        let te_col = header.iter().position(|h| h == "te_ms").unwrap();
        let series_col = header.iter().position(|h| h == "series_no").unwrap();
        let rows: Vec<Vec<String>> = reader
            .records()
            .map(|r| {
                let mut row: Vec<String> = r.unwrap().iter().map(str::to_string).collect();
                if row[series_col] == "4" {
                    row[te_col] = "[1.6, 4.0, 6.4]".to_string();
                }
                row
            })
            .collect();
        let mut writer = csv::Writer::from_path(&table_path).unwrap();
        writer.write_record(&header).unwrap();
        for row in &rows {
            writer.write_record(row).unwrap();
        }
        writer.flush().unwrap();

        let out = dir.path().join("results");
        let request = AnalysisRequest {
            dataset: Dataset::T3,
            method: Method::Regionwise,
            data_dir,
            output_dir: out.clone(),
            config: ThermometryConfig::default(),
            config_file: None,
            runs: vec![],
            write_images: false,
        };
        let report = run_analysis(&request).unwrap();

        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].run, 1);
        assert_eq!(report.runs[0].regions.len(), 3);
        assert_eq!(report.metadata_columns, vec!["flip_angle_deg", "sequence"]);
        assert!(out.join("run-01_thermometry_regions.csv").is_file());
        assert!(!out.join("run-02_thermometry_regions.csv").exists());
        assert!(out.join(SUMMARY_FILE_NAME).is_file());
    }

    #[test]
    fn segmentation_lookup_falls_back_to_uncompressed() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            find_segmentation(dir.path()),
            Err(ThermometryError::SegmentationNotFound(_))
        ));
        fs::write(dir.path().join("segmentation.nii"), b"").unwrap();
        assert_eq!(
            find_segmentation(dir.path()).unwrap(),
            dir.path().join("segmentation.nii")
        );
    }
}
