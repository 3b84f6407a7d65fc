use serde::{Deserialize, Serialize};

/// Proton gyromagnetic ratio over 2π, MHz/T.
pub const GAMMA_BAR_MHZ_PER_T: f64 = 42.577478;

/// Offset between kelvin and degrees Celsius.
pub const KELVIN_OFFSET: f64 = 273.15;

/// Linear relation between the CH2–OH chemical-shift separation of ethylene
/// glycol and temperature: `T[K] = intercept_k - slope_k_per_ppm * shift_ppm`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Calibration {
    pub intercept_k: f64,
    pub slope_k_per_ppm: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            intercept_k: 466.5,
            slope_k_per_ppm: 102.0,
        }
    }
}

impl Calibration {
    /// Temperature in °C for a peak separation in ppm.
    pub fn temperature_c(&self, shift_ppm: f64) -> f64 {
        self.intercept_k - self.slope_k_per_ppm * shift_ppm - KELVIN_OFFSET
    }

    /// Peak separation in ppm expected at `temperature_c`.
    pub fn shift_ppm(&self, temperature_c: f64) -> f64 {
        (self.intercept_k - (temperature_c + KELVIN_OFFSET)) / self.slope_k_per_ppm
    }

    /// Beat-frequency band (low, high) in Hz spanned by a temperature range.
    pub fn frequency_band_hz(&self, min_c: f64, max_c: f64, f0_mhz: f64) -> (f64, f64) {
        let a = ppm_to_hz(self.shift_ppm(min_c), f0_mhz);
        let b = ppm_to_hz(self.shift_ppm(max_c), f0_mhz);
        (a.min(b), a.max(b))
    }
}

/// Larmor frequency of protons at `field_t` tesla, MHz.
pub fn larmor_frequency_mhz(field_t: f64) -> f64 {
    field_t * GAMMA_BAR_MHZ_PER_T
}

/// Hz → ppm at an imaging frequency in MHz.
pub fn hz_to_ppm(hz: f64, f0_mhz: f64) -> f64 {
    hz / f0_mhz
}

/// ppm → Hz at an imaging frequency in MHz.
pub fn ppm_to_hz(ppm: f64, f0_mhz: f64) -> f64 {
    ppm * f0_mhz
}
