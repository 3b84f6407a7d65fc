use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{
    Array, AsArray, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeListArray, ListArray, StringArray,
};
use arrow::datatypes::DataType;
use log::{debug, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{BidsSidecar, MetadataValue, SeriesRecord, SeriesTable};
use crate::error::ThermometryError;

/// Base name of the series table inside a dataset directory.
pub const SERIES_TABLE_STEM: &str = "image_information";

/// Extensions tried for the series table, in order of preference.
pub const SERIES_TABLE_EXTENSIONS: [&str; 3] = ["csv", "json", "parquet"];

/// Columns with a fixed meaning; everything else becomes metadata.
const TEXT_COLUMNS: [&str; 2] = ["patient_name", "study_id"];
const TE_COLUMN: &str = "te_ms";

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Find `image_information.{csv,json,parquet}` in a dataset directory.
pub fn find_series_table(dir: &Path) -> Result<PathBuf, ThermometryError> {
    SERIES_TABLE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{SERIES_TABLE_STEM}.{ext}")))
        .find(|p| p.is_file())
        .ok_or_else(|| ThermometryError::SeriesTableNotFound(dir.to_path_buf()))
}

/// Load a series table from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.csv`     – header row, `te_ms` as a bracketed list `"[2.0, 4.5]"`
/// * `.json`    – `[{ "patient_name": ..., "te_ms": [...], ... }, ...]`
/// * `.parquet` – `te_ms` as a list column or text column
pub fn load_series_table(path: &Path) -> Result<SeriesTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let table = match ext.as_str() {
        "csv" => load_csv(path),
        "json" => load_json(path),
        "parquet" | "pq" => load_parquet(path),
        other => bail!("Unsupported series table extension: .{other}"),
    }
    .with_context(|| format!("loading series table {}", path.display()))?;

    debug!("loaded {} series from {}", table.len(), path.display());
    Ok(table)
}

/// Load every BIDS sidecar (`*.json`) in `dir`, sorted by file name.
///
/// The series table itself and files that are not JSON objects are skipped.
pub fn load_bids_sidecars(dir: &Path) -> Result<Vec<BidsSidecar>> {
    let pattern = format!("{}/*.json", glob::Pattern::escape(&dir.to_string_lossy()));
    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("bad sidecar pattern {pattern}"))?
        .filter_map(|entry| match entry {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Skipping unreadable path: {e}");
                None
            }
        })
        .filter(|p| {
            p.file_stem().and_then(|s| s.to_str()) != Some(SERIES_TABLE_STEM)
        })
        .collect();
    paths.sort();

    let mut sidecars = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading sidecar {}", path.display()))?;
        match serde_json::from_str::<JsonValue>(&text) {
            Ok(JsonValue::Object(fields)) => sidecars.push(BidsSidecar::from_fields(path, fields)),
            Ok(_) => warn!("Skipping {}: not a JSON object", path.display()),
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }
    Ok(sidecars)
}

/// Parse an echo-time list such as `"[1.2, 3.4]"`, `"(1.2; 3.4)"` or `"1.2 3.4"`.
pub fn parse_echo_list(s: &str) -> Result<Vec<f64>> {
    let inner = s
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);
    inner
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|tok| !tok.is_empty())
        .enumerate()
        .map(|(j, tok)| {
            tok.parse::<f64>()
                .with_context(|| format!("te_ms[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Row → SeriesRecord
// ---------------------------------------------------------------------------

fn record_from_row(
    row: usize,
    te_ms: Vec<f64>,
    mut cells: BTreeMap<String, MetadataValue>,
) -> Result<SeriesRecord> {
    let mut take_text = |col: &str| -> Result<String> {
        cells
            .remove(col)
            .and_then(|v| v.as_text())
            .with_context(|| format!("Row {row}: missing '{col}'"))
    };
    let patient_name = take_text("patient_name")?;
    let study_id = take_text("study_id")?;

    let mut take_int = |col: &str| -> Result<i64> {
        let value = cells
            .remove(col)
            .with_context(|| format!("Row {row}: missing '{col}'"))?;
        value
            .as_i64()
            .with_context(|| format!("Row {row}: '{col}' value '{value}' is not an integer"))
    };
    let series_no = take_int("series_no")?;
    let run = take_int("run")?;

    Ok(SeriesRecord {
        patient_name,
        study_id,
        series_no,
        run,
        te_ms,
        nifti_file: None,
        metadata: cells,
    })
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

fn load_csv(path: &Path) -> Result<SeriesTable> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut records = Vec::new();

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;

        let mut te_ms = Vec::new();
        let mut cells = BTreeMap::new();
        for (col_idx, value) in record.iter().enumerate() {
            let Some(col_name) = headers.get(col_idx) else {
                continue;
            };
            if col_name == TE_COLUMN {
                te_ms = parse_echo_list(value).with_context(|| format!("CSV row {row_no}"))?;
            } else if TEXT_COLUMNS.contains(&col_name.as_str()) {
                let cell = if value.is_empty() {
                    MetadataValue::Null
                } else {
                    MetadataValue::String(value.to_string())
                };
                cells.insert(col_name.clone(), cell);
            } else {
                cells.insert(col_name.clone(), guess_metadata_type(value));
            }
        }

        records.push(record_from_row(row_no, te_ms, cells)?);
    }

    Ok(SeriesTable::from_records(records))
}

fn guess_metadata_type(s: &str) -> MetadataValue {
    let s = s.trim();
    if s.is_empty() {
        return MetadataValue::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return MetadataValue::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return MetadataValue::Float(f);
    }
    if s == "true" || s == "false" {
        return MetadataValue::Bool(s == "true");
    }
    MetadataValue::String(s.to_string())
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented, `df.to_json(orient='records')`):
///
/// ```json
/// [
///   {
///     "patient_name": "EG_phantom",
///     "study_id": "1.2.840...",
///     "series_no": 5,
///     "run": 1,
///     "te_ms": [2.0, 4.0, 6.0]
///   },
///   ...
/// ]
/// ```
fn load_json(path: &Path) -> Result<SeriesTable> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let rows = root.as_array().context("Expected top-level JSON array")?;

    let mut records = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        let obj = row
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;

        let te_ms = match obj.get(TE_COLUMN) {
            Some(JsonValue::Array(values)) => values
                .iter()
                .enumerate()
                .map(|(j, v)| {
                    v.as_f64()
                        .with_context(|| format!("Row {i}, te_ms[{j}]: not a number"))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(JsonValue::String(s)) => {
                parse_echo_list(s).with_context(|| format!("Row {i}"))?
            }
            _ => Vec::new(),
        };

        let cells = obj
            .iter()
            .filter(|(key, _)| key.as_str() != TE_COLUMN)
            .map(|(key, val)| (key.clone(), json_to_metadata(val)))
            .collect();

        records.push(record_from_row(i, te_ms, cells)?);
    }

    Ok(SeriesTable::from_records(records))
}

fn json_to_metadata(val: &JsonValue) -> MetadataValue {
    match val {
        JsonValue::String(s) => MetadataValue::String(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetadataValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                MetadataValue::Float(f)
            } else {
                MetadataValue::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => MetadataValue::Bool(*b),
        JsonValue::Null => MetadataValue::Null,
        other => MetadataValue::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet series table.
///
/// `te_ms` may be `List<Float64|Float32>`, `LargeList<...>` or `Utf8`; other
/// columns are read as scalars. Works with files written by both **Pandas**
/// (`df.to_parquet()`) and **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path) -> Result<SeriesTable> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut records = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();
        let te_idx = schema.index_of(TE_COLUMN).ok();

        let cell_cols: Vec<(usize, String)> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != te_idx)
            .map(|(i, f)| (i, f.name().clone()))
            .collect();

        for row in 0..batch.num_rows() {
            let row_no = records.len();
            let te_ms = match te_idx {
                Some(idx) => extract_echo_times(batch.column(idx), row)
                    .with_context(|| format!("Row {row_no}: failed to read 'te_ms'"))?,
                None => Vec::new(),
            };

            let cells = cell_cols
                .iter()
                .map(|(col_idx, name)| {
                    (name.clone(), extract_metadata_value(batch.column(*col_idx), row))
                })
                .collect();

            records.push(record_from_row(row_no, te_ms, cells)?);
        }
    }

    Ok(SeriesTable::from_records(records))
}

// -- Parquet / Arrow helpers --

/// Echo times from a list column, or a text column holding a bracketed list.
fn extract_echo_times(col: &Arc<dyn Array>, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        return Ok(Vec::new());
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        DataType::Utf8 => return parse_echo_list(col.as_string::<i32>().value(row)),
        DataType::LargeUtf8 => return parse_echo_list(col.as_string::<i64>().value(row)),
        _ => return Ok(Vec::new()),
    };

    if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.unwrap_or(f32::NAN) as f64).collect())
    } else {
        bail!(
            "List inner type is {:?}, expected Float64 or Float32",
            values_array.data_type()
        )
    }
}

/// Extract a single scalar value from an Arrow column at a given row.
fn extract_metadata_value(col: &Arc<dyn Array>, row: usize) -> MetadataValue {
    if col.is_null(row) {
        return MetadataValue::Null;
    }
    let any = col.as_any();
    match col.data_type() {
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|s| MetadataValue::String(s.value(row).to_string()))
            .unwrap_or(MetadataValue::Null),
        DataType::LargeUtf8 => MetadataValue::String(col.as_string::<i64>().value(row).to_string()),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| MetadataValue::Integer(a.value(row) as i64))
            .unwrap_or(MetadataValue::Null),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| MetadataValue::Integer(a.value(row)))
            .unwrap_or(MetadataValue::Null),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| MetadataValue::Float(a.value(row) as f64))
            .unwrap_or(MetadataValue::Null),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| MetadataValue::Float(a.value(row)))
            .unwrap_or(MetadataValue::Null),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| MetadataValue::Bool(a.value(row)))
            .unwrap_or(MetadataValue::Null),
        other => MetadataValue::String(format!("{other:?}")),
    }
}
