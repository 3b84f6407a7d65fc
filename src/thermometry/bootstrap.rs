use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use super::echo::EchoStack;
use super::methods::FitContext;
use super::regions::Region;
use super::stats;

/// Distribution of a region's temperature over bootstrap resamples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootstrapSummary {
    pub mean_c: f64,
    pub std_c: Option<f64>,
    pub ci_low_c: f64,
    pub ci_high_c: f64,
    pub successes: usize,
    pub failures: usize,
}

/// Resample `region`'s voxels with replacement `iterations` times, fit the
/// mean signal of each resample, and summarise the temperatures.
///
/// Returns `None` when no resample could be fitted.
pub fn bootstrap_region(
    stack: &EchoStack,
    region: &Region,
    iterations: u32,
    seed: u64,
    ctx: &FitContext,
) -> Option<BootstrapSummary> {
    if region.is_empty() {
        return None;
    }
    let te = stack.echo_times();

    let outcomes: Vec<Option<f64>> = (0..iterations)
        .into_par_iter()
        .map(|k| {
            let mut rng = StdRng::seed_from_u64(iteration_seed(seed, region.label, k));
            let sample: Vec<usize> = (0..region.len())
                .map(|_| region.voxels[rng.gen_range(0..region.len())])
                .collect();
            let y = stack.mean_signal_sq(&sample);
            ctx.fit(&te, &y).ok().map(|tf| tf.temperature_c)
        })
        .collect();

    let mut temperatures: Vec<f64> = outcomes.iter().flatten().copied().collect();
    let failures = outcomes.len() - temperatures.len();
    temperatures.sort_by(f64::total_cmp);

    Some(BootstrapSummary {
        mean_c: stats::mean(&temperatures)?,
        std_c: stats::sample_std(&temperatures),
        ci_low_c: stats::percentile(&temperatures, 0.025)?,
        ci_high_c: stats::percentile(&temperatures, 0.975)?,
        successes: temperatures.len(),
        failures,
    })
}

/// Seed for iteration `k` of region `label`, independent of scheduling order.
pub fn iteration_seed(seed: u64, label: i64, k: u32) -> u64 {
    splitmix64(seed ^ splitmix64((label as u64).rotate_left(32) ^ k as u64))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}
