//! Synthetic ethylene glycol phantom datasets with known vial temperatures.
//!
//! The generated directory has the same layout as a scanner export: a series
//! table, one BIDS sidecar and one multi-echo magnitude image per series, and
//! a segmentation of the vials.

use std::f64::consts::PI;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, Float64Builder, Int64Array, ListBuilder, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::ValueEnum;
use log::debug;
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::cli::Dataset;
use crate::data::loader::SERIES_TABLE_STEM;
use crate::data::nifti::{Geometry, Volume, write_volume};
use crate::thermometry::calibration::{Calibration, ppm_to_hz};

const PATIENT_NAME: &str = "EG_phantom";
const STUDY_ID: &str = "1.2.826.0.1.3680043.8.498.1";
const SEQUENCE: &str = "MEGRE";
const FLIP_ANGLE_DEG: f64 = 15.0;

/// File format of the generated series table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TableFormat {
    Csv,
    Json,
    Parquet,
}

impl TableFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::Json => "json",
            TableFormat::Parquet => "parquet",
        }
    }
}

/// A cylindrical vial seen in cross-section.
#[derive(Debug, Clone, PartialEq)]
pub struct Vial {
    pub label: i64,
    /// Centre (x, y) in voxels.
    pub center: [f64; 2],
    pub radius: f64,
}

impl Vial {
    fn contains(&self, x: usize, y: usize) -> bool {
        let dx = x as f64 - self.center[0];
        let dy = y as f64 - self.center[1];
        dx * dx + dy * dy <= self.radius * self.radius
    }
}

/// One acquisition run: a temperature per vial, in vial order.
#[derive(Debug, Clone, PartialEq)]
pub struct PhantomRun {
    pub run: i64,
    pub temperatures_c: Vec<f64>,
}

/// Everything that determines a synthetic dataset.
#[derive(Debug, Clone)]
pub struct PhantomSpec {
    pub dataset: Dataset,
    pub grid: [usize; 3],
    pub vials: Vec<Vial>,
    pub runs: Vec<PhantomRun>,
    /// Echo times of each series of a run, in milliseconds.
    pub echo_trains_ms: Vec<Vec<f64>>,
    /// CH2 and OH signal amplitudes.
    pub amplitudes: [f64; 2],
    pub r2star_per_s: f64,
    /// Standard deviation of the complex Gaussian noise, per channel.
    pub noise_sigma: f64,
    pub calibration: Calibration,
}

impl PhantomSpec {
    /// Three vials on a 16×16 slice, two runs, three interleaved 8-echo trains.
    pub fn default_for(dataset: Dataset) -> Self {
        // Trains start 0.8 ms apart with 2.4 ms spacing, so their union samples
        // the beat every 0.8 ms. Times are built from tenths of a millisecond
        // to keep them exact in the table.
        let echo_trains_ms = [16u32, 24, 32]
            .iter()
            .map(|&start| (0..8).map(|k| f64::from(start + 24 * k) / 10.0).collect())
            .collect();

        PhantomSpec {
            dataset,
            grid: [16, 16, 1],
            vials: vec![
                Vial { label: 1, center: [4.0, 4.0], radius: 3.0 },
                Vial { label: 2, center: [11.0, 4.0], radius: 3.0 },
                Vial { label: 3, center: [8.0, 11.0], radius: 3.0 },
            ],
            runs: vec![
                PhantomRun { run: 1, temperatures_c: vec![20.0, 35.0, 50.0] },
                PhantomRun { run: 2, temperatures_c: vec![25.0, 40.0, 55.0] },
            ],
            echo_trains_ms,
            amplitudes: [2000.0 / 3.0, 1000.0 / 3.0],
            r2star_per_s: 20.0,
            noise_sigma: 2.0,
            calibration: Calibration::default(),
        }
    }

    pub fn imaging_frequency_mhz(&self) -> f64 {
        self.dataset.nominal_frequency_mhz()
    }

    fn series_no(&self, run_idx: usize, train_idx: usize) -> i64 {
        (run_idx * self.echo_trains_ms.len() + train_idx + 1) as i64
    }

    /// Label image of the vials.
    pub fn segmentation(&self) -> Volume {
        let [nx, ny, nz] = self.grid;
        let mut volume = Volume::filled([nx, ny, nz, 1], Geometry::default(), 0.0);
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    if let Some(vial) = self.vials.iter().find(|v| v.contains(x, y)) {
                        volume.data[x + nx * (y + ny * z)] = vial.label as f32;
                    }
                }
            }
        }
        volume
    }

    /// Magnitude image of one echo train acquired with the vials at
    /// `temperatures_c`.
    pub fn series_volume(&self, temperatures_c: &[f64], te_ms: &[f64], rng: &mut StdRng) -> Volume {
        let [nx, ny, nz] = self.grid;
        let n = nx * ny * nz;
        let f0 = self.imaging_frequency_mhz();
        let [a, b] = self.amplitudes;

        let beat_hz: Vec<Option<f64>> = (0..n)
            .map(|voxel| {
                let (x, y) = (voxel % nx, (voxel / nx) % ny);
                self.vials
                    .iter()
                    .zip(temperatures_c)
                    .find(|(vial, _)| vial.contains(x, y))
                    .map(|(_, &t)| ppm_to_hz(self.calibration.shift_ppm(t), f0))
            })
            .collect();

        let mut volume = Volume::filled([nx, ny, nz, te_ms.len()], Geometry::default(), 0.0);
        for (frame, &te) in te_ms.iter().enumerate() {
            let t = te / 1000.0;
            let decay = (-self.r2star_per_s * t).exp();
            for (voxel, df) in beat_hz.iter().enumerate() {
                let (re, im) = match df {
                    Some(df) => {
                        let phase = 2.0 * PI * df * t;
                        (decay * (a + b * phase.cos()), decay * b * phase.sin())
                    }
                    None => (0.0, 0.0),
                };
                let re = re + gauss(rng, self.noise_sigma);
                let im = im + gauss(rng, self.noise_sigma);
                volume.data[voxel + n * frame] = re.hypot(im) as f32;
            }
        }
        volume
    }
}

fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    let u1 = rng.gen::<f64>().max(1e-15);
    let u2 = rng.gen::<f64>();
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

struct TableRow {
    series_no: i64,
    run: i64,
    te_ms: Vec<f64>,
}

fn format_echo_list(te_ms: &[f64]) -> String {
    let items: Vec<String> = te_ms.iter().map(|te| te.to_string()).collect();
    format!("[{}]", items.join(", "))
}

fn write_csv_table(path: &Path, rows: &[TableRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "patient_name",
        "study_id",
        "series_no",
        "run",
        "te_ms",
        "sequence",
        "flip_angle_deg",
    ])?;
    for row in rows {
        writer.write_record([
            PATIENT_NAME.to_string(),
            STUDY_ID.to_string(),
            row.series_no.to_string(),
            row.run.to_string(),
            format_echo_list(&row.te_ms),
            SEQUENCE.to_string(),
            FLIP_ANGLE_DEG.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_json_table(path: &Path, rows: &[TableRow]) -> Result<()> {
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "patient_name": PATIENT_NAME,
                "study_id": STUDY_ID,
                "series_no": row.series_no,
                "run": row.run,
                "te_ms": row.te_ms,
                "sequence": SEQUENCE,
                "flip_angle_deg": FLIP_ANGLE_DEG,
            })
        })
        .collect();
    fs::write(path, serde_json::to_string_pretty(&records)?)?;
    Ok(())
}

fn write_parquet_table(path: &Path, rows: &[TableRow]) -> Result<()> {
    let mut te_builder = ListBuilder::new(Float64Builder::new());
    for row in rows {
        let values = te_builder.values();
        for &te in &row.te_ms {
            values.append_value(te);
        }
        te_builder.append(true);
    }
    let te_array = te_builder.finish();

    let text = |value: &str| StringArray::from(vec![value; rows.len()]);
    let schema = Arc::new(Schema::new(vec![
        Field::new("patient_name", DataType::Utf8, false),
        Field::new("study_id", DataType::Utf8, false),
        Field::new("series_no", DataType::Int64, false),
        Field::new("run", DataType::Int64, false),
        Field::new(
            "te_ms",
            DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
            false,
        ),
        Field::new("sequence", DataType::Utf8, false),
        Field::new("flip_angle_deg", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(text(PATIENT_NAME)),
            Arc::new(text(STUDY_ID)),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.series_no))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.run))),
            Arc::new(te_array),
            Arc::new(text(SEQUENCE)),
            Arc::new(Float64Array::from(vec![FLIP_ANGLE_DEG; rows.len()])),
        ],
    )
    .context("building record batch")?;

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Write a complete dataset for `spec` into `dir` and return every file
/// written. The same `seed` reproduces the same noise.
pub fn write_phantom_dataset(
    dir: &Path,
    spec: &PhantomSpec,
    seed: u64,
    format: TableFormat,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut written = Vec::new();
    let mut rows = Vec::new();

    for (run_idx, run) in spec.runs.iter().enumerate() {
        for (train_idx, te_ms) in spec.echo_trains_ms.iter().enumerate() {
            let series_no = spec.series_no(run_idx, train_idx);
            let stem = format!("sub-phantom_run-{:02}_acq-train{}_MEGRE", run.run, train_idx + 1);

            let sidecar_path = dir.join(format!("{stem}.json"));
            let sidecar = json!({
                "StudyInstanceUID": STUDY_ID,
                "SeriesNumber": series_no,
                "SeriesDescription": format!("EG thermometry run {} train {}", run.run, train_idx + 1),
                "ImagingFrequency": spec.imaging_frequency_mhz(),
                "MagneticFieldStrength": spec.dataset.nominal_field_t(),
                "EchoTime": te_ms.iter().map(|te| te / 1000.0).collect::<Vec<_>>(),
                "FlipAngle": FLIP_ANGLE_DEG,
            });
            fs::write(&sidecar_path, serde_json::to_string_pretty(&sidecar)?)
                .with_context(|| format!("writing {}", sidecar_path.display()))?;
            written.push(sidecar_path);

            let image_path = dir.join(format!("{stem}.nii.gz"));
            let volume = spec.series_volume(&run.temperatures_c, te_ms, &mut rng);
            write_volume(&image_path, &volume, "synthetic EG phantom")?;
            debug!("wrote {}", image_path.display());
            written.push(image_path);

            rows.push(TableRow {
                series_no,
                run: run.run,
                te_ms: te_ms.clone(),
            });
        }
    }

    let segmentation_path = dir.join("segmentation.nii.gz");
    write_volume(&segmentation_path, &spec.segmentation(), "vial labels")?;
    written.push(segmentation_path);

    let table_path = dir.join(format!("{SERIES_TABLE_STEM}.{}", format.extension()));
    match format {
        TableFormat::Csv => write_csv_table(&table_path, &rows),
        TableFormat::Json => write_json_table(&table_path, &rows),
        TableFormat::Parquet => write_parquet_table(&table_path, &rows),
    }
    .with_context(|| format!("writing {}", table_path.display()))?;
    written.push(table_path);

    Ok(written)
}
