use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

// ---------------------------------------------------------------------------
// MetadataValue – a single cell in an extra series-table column
// ---------------------------------------------------------------------------

/// A dynamically-typed value for series-table columns the analysis does not
/// interpret itself (operator, coil, reference thermometer readings, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v:.4}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Null => write!(f, "<null>"),
        }
    }
}

impl MetadataValue {
    /// Try to interpret the value as an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to interpret the value as an integer. Floats with no fractional
    /// part are accepted since spreadsheets export integers that way.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(i) => Some(*i),
            MetadataValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            MetadataValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text rendering used for identifier columns (`patient_name`, `study_id`).
    pub fn as_text(&self) -> Option<String> {
        match self {
            MetadataValue::Null => None,
            MetadataValue::String(s) => Some(s.clone()),
            MetadataValue::Float(v) => Some(v.to_string()),
            other => Some(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// SeriesRecord – one row of the series table
// ---------------------------------------------------------------------------

/// One acquired series as listed in `image_information.*`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesRecord {
    pub patient_name: String,
    pub study_id: String,
    pub series_no: i64,
    pub run: i64,
    /// Echo times in milliseconds, acquisition order.
    pub te_ms: Vec<f64>,
    /// Image file resolved from the matching sidecar, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nifti_file: Option<PathBuf>,
    /// Every column not listed above.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl SeriesRecord {
    /// Echo times converted to seconds.
    pub fn te_seconds(&self) -> Vec<f64> {
        self.te_ms.iter().map(|te| te / 1000.0).collect()
    }
}

// ---------------------------------------------------------------------------
// BidsSidecar – one JSON sidecar next to a NIfTI image
// ---------------------------------------------------------------------------

/// Study / series identity and scanner fields of a BIDS sidecar.
#[derive(Debug, Clone)]
pub struct BidsSidecar {
    pub filename: PathBuf,
    pub study_id: String,
    pub series_no: i64,
    pub fields: Map<String, JsonValue>,
}

impl BidsSidecar {
    pub fn from_fields(filename: PathBuf, fields: Map<String, JsonValue>) -> Self {
        let study_id = fields
            .get("StudyInstanceUID")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown_study")
            .to_string();
        let series_no = fields
            .get("SeriesNumber")
            .and_then(|v| {
                v.as_i64()
                    .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            })
            .unwrap_or(-1);
        BidsSidecar {
            filename,
            study_id,
            series_no,
            fields,
        }
    }

    /// `ImagingFrequency` in MHz.
    pub fn imaging_frequency_mhz(&self) -> Option<f64> {
        self.positive_number("ImagingFrequency")
    }

    /// `MagneticFieldStrength` in tesla.
    pub fn field_strength_t(&self) -> Option<f64> {
        self.positive_number("MagneticFieldStrength")
    }

    fn positive_number(&self, key: &str) -> Option<f64> {
        self.fields
            .get(key)
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite() && *v > 0.0)
    }

    /// The image this sidecar describes: same stem, `.nii.gz` preferred,
    /// `.nii` when only that exists.
    pub fn image_path(&self) -> PathBuf {
        let gz = self.filename.with_extension("nii.gz");
        if gz.exists() {
            return gz;
        }
        let plain = self.filename.with_extension("nii");
        if plain.exists() {
            plain
        } else {
            gz
        }
    }
}

// ---------------------------------------------------------------------------
// SeriesTable – the complete loaded table
// ---------------------------------------------------------------------------

/// All series rows of a dataset plus the set of extra column names.
#[derive(Debug, Clone, Default)]
pub struct SeriesTable {
    pub records: Vec<SeriesRecord>,
    pub extra_columns: Vec<String>,
}

impl SeriesTable {
    /// Build the extra-column index from the loaded records.
    pub fn from_records(records: Vec<SeriesRecord>) -> Self {
        let mut extra_columns: Vec<String> = records
            .iter()
            .flat_map(|r| r.metadata.keys().cloned())
            .collect();
        extra_columns.sort();
        extra_columns.dedup();
        SeriesTable {
            records,
            extra_columns,
        }
    }

    /// Number of series.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sidecar_defaults_when_keys_missing() {
        let sc = BidsSidecar::from_fields(PathBuf::from("a.json"), Map::new());
        assert_eq!(sc.study_id, "unknown_study");
        assert_eq!(sc.series_no, -1);
        assert_eq!(sc.imaging_frequency_mhz(), None);
    }

    #[test]
    fn sidecar_reads_identity_and_frequency() {
        let fields = json!({
            "StudyInstanceUID": "1.2.3",
            "SeriesNumber": 7,
            "ImagingFrequency": 127.74,
            "MagneticFieldStrength": 3
        });
        let JsonValue::Object(map) = fields else {
            panic!("not an object")
        };
        let sc = BidsSidecar::from_fields(PathBuf::from("dir/sub-01_run-1.json"), map);
        assert_eq!(sc.study_id, "1.2.3");
        assert_eq!(sc.series_no, 7);
        assert_eq!(sc.imaging_frequency_mhz(), Some(127.74));
        assert_eq!(sc.field_strength_t(), Some(3.0));
        assert_eq!(
            sc.image_path(),
            PathBuf::from("dir/sub-01_run-1.nii.gz")
        );
    }

    #[test]
    fn sidecar_series_number_must_be_integral() {
        let sidecar = |number: JsonValue| {
            let mut map = Map::new();
            map.insert("SeriesNumber".into(), number);
            BidsSidecar::from_fields(PathBuf::from("a.json"), map)
        };
        assert_eq!(sidecar(json!(7.0)).series_no, 7);
        assert_eq!(sidecar(json!(7.9)).series_no, -1);
        assert_eq!(sidecar(json!("7")).series_no, -1);
    }

    #[test]
    fn metadata_integer_coercions() {
        assert_eq!(MetadataValue::Float(4.0).as_i64(), Some(4));
        assert_eq!(MetadataValue::Float(4.5).as_i64(), None);
        assert_eq!(MetadataValue::String(" 12 ".into()).as_i64(), Some(12));
        assert_eq!(MetadataValue::Null.as_text(), None);
        assert_eq!(MetadataValue::Integer(3).as_text().as_deref(), Some("3"));
    }

    #[test]
    fn te_seconds_converts_milliseconds() {
        let record = SeriesRecord {
            patient_name: "phantom".into(),
            study_id: "s".into(),
            series_no: 1,
            run: 1,
            te_ms: vec![2.0, 4.5],
            nifti_file: None,
            metadata: BTreeMap::new(),
        };
        assert_eq!(record.te_seconds(), vec![0.002, 0.0045]);
    }
}
