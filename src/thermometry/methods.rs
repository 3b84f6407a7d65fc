use log::{debug, warn};
use rayon::prelude::*;
use serde::Serialize;

use super::bootstrap::bootstrap_region;
use super::calibration::{Calibration, hz_to_ppm};
use super::echo::EchoStack;
use super::fit::{BeatFit, FitSettings, fit_beat};
use super::regions::Region;
use super::stats;
use crate::cli::Method;
use crate::config::ThermometryConfig;
use crate::error::ThermometryResult;

// ---------------------------------------------------------------------------
// FitContext – fit settings plus calibration at one imaging frequency
// ---------------------------------------------------------------------------

/// A beat fit converted to temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureFit {
    pub fit: BeatFit,
    pub shift_ppm: f64,
    pub temperature_c: f64,
}

/// Everything needed to turn a signal into a temperature for one run.
#[derive(Debug, Clone)]
pub struct FitContext {
    pub settings: FitSettings,
    pub calibration: Calibration,
    pub f0_mhz: f64,
    pub min_r_squared: f64,
}

impl FitContext {
    pub fn new(config: &ThermometryConfig, f0_mhz: f64) -> Self {
        FitContext {
            settings: config.fit.settings(&config.calibration, f0_mhz),
            calibration: config.calibration,
            f0_mhz,
            min_r_squared: config.fit.min_r_squared,
        }
    }

    /// Fit squared-magnitude samples and convert the beat frequency.
    pub fn fit(&self, te_s: &[f64], y: &[f64]) -> ThermometryResult<TemperatureFit> {
        let fit = fit_beat(te_s, y, &self.settings)?;
        let shift_ppm = hz_to_ppm(fit.delta_f_hz, self.f0_mhz);
        Ok(TemperatureFit {
            fit,
            shift_ppm,
            temperature_c: self.calibration.temperature_c(shift_ppm),
        })
    }

    /// Whether a fit is good enough to enter a voxelwise map.
    pub fn accepts(&self, fit: &TemperatureFit) -> bool {
        fit.fit.r_squared >= self.min_r_squared
    }
}

// ---------------------------------------------------------------------------
// RegionEstimate – one region's result, whatever the method
// ---------------------------------------------------------------------------

/// Temperature estimate of one region. Columns that a method does not produce
/// stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegionEstimate {
    pub label: i64,
    pub n_voxels: usize,
    /// Headline temperature: the region fit (regionwise, bootstrap point
    /// estimate) or the mean of fitted voxels (voxelwise).
    pub temperature_c: Option<f64>,
    pub mean_c: Option<f64>,
    pub std_c: Option<f64>,
    pub median_c: Option<f64>,
    pub ci_low_c: Option<f64>,
    pub ci_high_c: Option<f64>,
    /// Fitted voxels (voxelwise) or successful resamples (bootstrap).
    pub n_samples: Option<usize>,
    pub delta_f_hz: Option<f64>,
    pub delta_ppm: Option<f64>,
    pub r2star_per_s: Option<f64>,
    pub r_squared: Option<f64>,
}

impl RegionEstimate {
    fn empty(region: &Region) -> Self {
        RegionEstimate {
            label: region.label,
            n_voxels: region.len(),
            ..Default::default()
        }
    }

    fn from_fit(region: &Region, tf: &TemperatureFit) -> Self {
        RegionEstimate {
            temperature_c: Some(tf.temperature_c),
            delta_f_hz: Some(tf.fit.delta_f_hz),
            delta_ppm: Some(tf.shift_ppm),
            r2star_per_s: Some(tf.fit.r2star_per_s),
            r_squared: Some(tf.fit.r_squared),
            ..Self::empty(region)
        }
    }
}

/// Per-region estimates plus a temperature map (°C, NaN outside fitted
/// voxels) on the stack's grid.
#[derive(Debug, Clone)]
pub struct MethodOutput {
    pub estimates: Vec<RegionEstimate>,
    pub temperature_map: Vec<f32>,
}

/// Bootstrap parameters for [`Method::RegionwiseBootstrap`].
#[derive(Debug, Clone, Copy)]
pub struct BootstrapSettings {
    pub iterations: u32,
    pub seed: u64,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn run_method(
    method: Method,
    stack: &EchoStack,
    regions: &[Region],
    ctx: &FitContext,
    bootstrap: BootstrapSettings,
) -> MethodOutput {
    match method {
        Method::Regionwise => regionwise(stack, regions, ctx),
        Method::Voxelwise => voxelwise(stack, regions, ctx),
        Method::RegionwiseBootstrap => regionwise_bootstrap(stack, regions, ctx, bootstrap),
    }
}

fn empty_map(stack: &EchoStack) -> Vec<f32> {
    vec![f32::NAN; stack.grid().iter().product()]
}

fn paint(map: &mut [f32], region: &Region, value: f64) {
    for &v in &region.voxels {
        map[v] = value as f32;
    }
}

/// One fit of the region-mean signal.
fn fit_region(stack: &EchoStack, region: &Region, te: &[f64], ctx: &FitContext) -> Option<TemperatureFit> {
    let y = stack.mean_signal_sq(&region.voxels);
    match ctx.fit(te, &y) {
        Ok(tf) => {
            if !ctx.accepts(&tf) {
                warn!(
                    "Region {}: poor fit (R² = {:.3}), temperature may be unreliable",
                    region.label, tf.fit.r_squared
                );
            }
            debug!(
                "Region {}: Δf = {:.2} Hz, R2* = {:.1} 1/s, T = {:.2} °C",
                region.label, tf.fit.delta_f_hz, tf.fit.r2star_per_s, tf.temperature_c
            );
            Some(tf)
        }
        Err(e) => {
            warn!("Region {}: {e}", region.label);
            None
        }
    }
}

/// Fit the mean signal of every region once.
pub fn regionwise(stack: &EchoStack, regions: &[Region], ctx: &FitContext) -> MethodOutput {
    let te = stack.echo_times();
    let mut map = empty_map(stack);
    let estimates = regions
        .iter()
        .map(|region| match fit_region(stack, region, &te, ctx) {
            Some(tf) => {
                paint(&mut map, region, tf.temperature_c);
                RegionEstimate::from_fit(region, &tf)
            }
            None => RegionEstimate::empty(region),
        })
        .collect();
    MethodOutput {
        estimates,
        temperature_map: map,
    }
}

/// Fit every labelled voxel and summarise the accepted fits per region.
pub fn voxelwise(stack: &EchoStack, regions: &[Region], ctx: &FitContext) -> MethodOutput {
    let te = stack.echo_times();
    let mut map = empty_map(stack);
    let mut estimates = Vec::with_capacity(regions.len());

    for region in regions {
        let temps: Vec<Option<f64>> = region
            .voxels
            .par_iter()
            .map(|&v| {
                ctx.fit(&te, &stack.voxel_signal_sq(v))
                    .ok()
                    .filter(|tf| ctx.accepts(tf))
                    .map(|tf| tf.temperature_c)
            })
            .collect();

        for (&v, t) in region.voxels.iter().zip(&temps) {
            if let Some(t) = t {
                map[v] = *t as f32;
            }
        }

        let fitted: Vec<f64> = temps.iter().flatten().copied().collect();
        let rejected = region.len() - fitted.len();
        if rejected > 0 {
            debug!("Region {}: {rejected} of {} voxels not fitted", region.label, region.len());
        }
        if fitted.is_empty() {
            warn!("Region {}: no voxel could be fitted", region.label);
        }

        let mean = stats::mean(&fitted);
        estimates.push(RegionEstimate {
            temperature_c: mean,
            mean_c: mean,
            std_c: stats::sample_std(&fitted),
            median_c: stats::median(&fitted),
            n_samples: Some(fitted.len()),
            ..RegionEstimate::empty(region)
        });
    }

    MethodOutput {
        estimates,
        temperature_map: map,
    }
}

/// Regionwise point estimate plus a bootstrap over the region's voxels.
pub fn regionwise_bootstrap(
    stack: &EchoStack,
    regions: &[Region],
    ctx: &FitContext,
    bootstrap: BootstrapSettings,
) -> MethodOutput {
    let te = stack.echo_times();
    let mut map = empty_map(stack);
    let mut estimates = Vec::with_capacity(regions.len());

    for region in regions {
        let mut estimate = match fit_region(stack, region, &te, ctx) {
            Some(tf) => {
                paint(&mut map, region, tf.temperature_c);
                RegionEstimate::from_fit(region, &tf)
            }
            None => RegionEstimate::empty(region),
        };

        match bootstrap_region(stack, region, bootstrap.iterations, bootstrap.seed, ctx) {
            Some(summary) => {
                if summary.failures > 0 {
                    warn!(
                        "Region {}: {} of {} bootstrap fits failed",
                        region.label, summary.failures, bootstrap.iterations
                    );
                }
                estimate.mean_c = Some(summary.mean_c);
                estimate.std_c = summary.std_c;
                estimate.ci_low_c = Some(summary.ci_low_c);
                estimate.ci_high_c = Some(summary.ci_high_c);
                estimate.n_samples = Some(summary.successes);
            }
            None => {
                warn!("Region {}: every bootstrap fit failed", region.label);
                estimate.n_samples = Some(0);
            }
        }
        estimates.push(estimate);
    }

    MethodOutput {
        estimates,
        temperature_map: map,
    }
}
