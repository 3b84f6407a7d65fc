use std::path::PathBuf;

use thiserror::Error;

/// Domain failures of the thermometry pipeline.
///
/// Loader and I/O paths wrap these in `anyhow` with file context; the fitting
/// code returns them directly so callers can tell a bad voxel from a bad file.
#[derive(Debug, Error)]
pub enum ThermometryError {
    #[error("Data directory not found at {}", .0.display())]
    DataDirNotFound(PathBuf),

    #[error("Segmentation file not found: {}", .0.display())]
    SegmentationNotFound(PathBuf),

    #[error("Series table not found in {} (expected image_information.csv, .json or .parquet)", .0.display())]
    SeriesTableNotFound(PathBuf),

    #[error("invalid NIfTI file: {0}")]
    InvalidNifti(String),

    #[error("unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("image grid {found:?} does not match segmentation grid {expected:?}")]
    GridMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("series {series_no}: image has {found} echoes but {expected} echo times are listed")]
    EchoCountMismatch {
        series_no: i64,
        expected: usize,
        found: usize,
    },

    #[error("need at least {required} echoes to fit, got {found}")]
    InsufficientEchoes { required: usize, found: usize },

    #[error("{echo_times} echo times but {samples} samples")]
    LengthMismatch { echo_times: usize, samples: usize },

    #[error("fit failed: {0}")]
    FitFailed(String),

    #[error("run {0} is not present in the series table")]
    UnknownRun(i64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ThermometryResult<T> = std::result::Result<T, ThermometryError>;
