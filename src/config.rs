use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ThermometryError;
use crate::thermometry::calibration::{Calibration, ppm_to_hz};
use crate::thermometry::fit::FitSettings;

/// File name looked up in the dataset directory when `--config` is not given.
pub const CONFIG_FILE_NAME: &str = "thermometry.toml";

/// Search space and acceptance threshold of the beat fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FitConfig {
    /// Lower end of the temperature search range (°C)
    pub min_temperature_c: f64,
    /// Upper end of the temperature search range (°C)
    pub max_temperature_c: f64,
    /// Beat-frequency grid spacing (Hz)
    pub frequency_step_hz: f64,
    /// Largest R2* considered (1/s)
    pub r2star_max: f64,
    /// R2* grid spacing (1/s)
    pub r2star_step: f64,
    /// Golden-section refinement rounds after the grid search
    pub refine_rounds: u32,
    /// Voxel fits below this R² are dropped from voxelwise maps
    pub min_r_squared: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_temperature_c: -10.0,
            max_temperature_c: 90.0,
            frequency_step_hz: 1.0,
            r2star_max: 100.0,
            r2star_step: 5.0,
            refine_rounds: 2,
            min_r_squared: 0.5,
        }
    }
}

impl FitConfig {
    /// Concrete fit settings at imaging frequency `f0_mhz`.
    pub fn settings(&self, calibration: &Calibration, f0_mhz: f64) -> FitSettings {
        let (freq_min_hz, freq_max_hz) =
            calibration.frequency_band_hz(self.min_temperature_c, self.max_temperature_c, f0_mhz);
        FitSettings {
            freq_min_hz,
            freq_max_hz,
            freq_step_hz: self.frequency_step_hz,
            r2star_max: self.r2star_max,
            r2star_step: self.r2star_step,
            refine_rounds: self.refine_rounds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnalysisConfig {
    pub bootstrap_iterations: u32,
    pub seed: u64,
    /// Regions with fewer voxels are skipped
    pub min_region_voxels: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            bootstrap_iterations: 100,
            seed: 42,
            min_region_voxels: 1,
        }
    }
}

/// Colour scale of the rendered temperature slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutputConfig {
    pub display_min_c: f64,
    pub display_max_c: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            display_min_c: 0.0,
            display_max_c: 60.0,
        }
    }
}

/// Complete analysis configuration, as read from `thermometry.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThermometryConfig {
    pub calibration: Calibration,
    pub fit: FitConfig,
    pub analysis: AnalysisConfig,
    pub output: OutputConfig,
}

impl ThermometryConfig {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ThermometryError> {
        let fail = |msg: &str| Err(ThermometryError::InvalidConfig(msg.to_string()));

        if self.calibration.slope_k_per_ppm == 0.0 || !self.calibration.slope_k_per_ppm.is_finite() {
            return fail("calibration.slope_k_per_ppm must be a non-zero number");
        }
        if !(self.fit.min_temperature_c < self.fit.max_temperature_c) {
            return fail("fit.min_temperature_c must be below fit.max_temperature_c");
        }
        if !(self.fit.frequency_step_hz > 0.0) || !(self.fit.r2star_step > 0.0) {
            return fail("fit.frequency_step_hz and fit.r2star_step must be positive");
        }
        if !(self.fit.r2star_max >= 0.0) {
            return fail("fit.r2star_max must not be negative");
        }
        if self.analysis.bootstrap_iterations == 0 {
            return fail("analysis.bootstrap_iterations must be at least 1");
        }
        if self.analysis.min_region_voxels == 0 {
            return fail("analysis.min_region_voxels must be at least 1");
        }
        if !(self.output.display_min_c < self.output.display_max_c) {
            return fail("output.display_min_c must be below output.display_max_c");
        }
        Ok(())
    }

    /// Frequency resolution of the grid, in ppm, at `f0_mhz`.
    pub fn frequency_step_ppm(&self, f0_mhz: f64) -> f64 {
        self.fit.frequency_step_hz / ppm_to_hz(1.0, f0_mhz)
    }
}

/// Parse and validate a TOML configuration string.
pub fn parse_config(contents: &str) -> Result<ThermometryConfig> {
    let config: ThermometryConfig = toml::from_str(contents).context("parsing TOML")?;
    config.validate()?;
    Ok(config)
}

/// Load the configuration: `explicit` if given, else `thermometry.toml` in
/// `data_dir` if present, else defaults. Returns the file used, if any.
pub fn load_config(
    explicit: Option<&Path>,
    data_dir: &Path,
) -> Result<(ThermometryConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => Some(data_dir.join(CONFIG_FILE_NAME)).filter(|p| p.is_file()),
    };

    match path {
        Some(path) => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config = parse_config(&contents)
                .with_context(|| format!("loading config {}", path.display()))?;
            debug!("configuration loaded from {}", path.display());
            Ok((config, Some(path)))
        }
        None => Ok((ThermometryConfig::default(), None)),
    }
}
