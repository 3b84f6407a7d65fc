//! Beat-frequency fit of multi-echo magnitude data.
//!
//! Two resonances separated by `Δf` give a squared magnitude
//!
//! ```text
//! y(t) = exp(-2·R2*·t) · (a + b·cos(2πΔf·t) + c·sin(2πΔf·t))
//! ```
//!
//! which is linear in `(a, b, c)` once `(Δf, R2*)` is fixed. The fit scans a
//! grid over both nonlinear parameters, solving the 3×3 least-squares problem
//! at every node, then polishes the best node with golden-section searches.

use std::f64::consts::PI;

use serde::Serialize;

use crate::error::{ThermometryError, ThermometryResult};

/// Fewest echoes that leave the five-parameter model overdetermined.
pub const MIN_ECHOES: usize = 5;

const GOLDEN_ITERATIONS: usize = 40;

/// Search space and effort of [`fit_beat`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitSettings {
    pub freq_min_hz: f64,
    pub freq_max_hz: f64,
    pub freq_step_hz: f64,
    pub r2star_max: f64,
    pub r2star_step: f64,
    pub refine_rounds: u32,
}

/// Best-fit parameters of the beat model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BeatFit {
    pub delta_f_hz: f64,
    pub r2star_per_s: f64,
    /// `(a, b, c)` of the model.
    pub coefficients: [f64; 3],
    pub rss: f64,
    pub r_squared: f64,
}

/// Fit the beat model to squared-magnitude samples `y` at echo times `te_s`.
pub fn fit_beat(te_s: &[f64], y: &[f64], settings: &FitSettings) -> ThermometryResult<BeatFit> {
    if te_s.len() != y.len() {
        return Err(ThermometryError::LengthMismatch {
            echo_times: te_s.len(),
            samples: y.len(),
        });
    }
    if te_s.len() < MIN_ECHOES {
        return Err(ThermometryError::InsufficientEchoes {
            required: MIN_ECHOES,
            found: te_s.len(),
        });
    }
    if te_s.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(ThermometryError::FitFailed("non-finite sample".into()));
    }
    validate_settings(settings)?;

    let problem = Problem { te_s, y };
    let freqs = grid(settings.freq_min_hz, settings.freq_max_hz, settings.freq_step_hz);
    let rates = grid(0.0, settings.r2star_max, settings.r2star_step);
    let decays: Vec<Vec<f64>> = rates
        .iter()
        .map(|r| te_s.iter().map(|t| (-2.0 * r * t).exp()).collect())
        .collect();

    let mut best: Option<(f64, f64, f64)> = None;
    let mut cos_t = vec![0.0; te_s.len()];
    let mut sin_t = vec![0.0; te_s.len()];
    for &f in &freqs {
        for (i, t) in te_s.iter().enumerate() {
            let (s, c) = (2.0 * PI * f * t).sin_cos();
            cos_t[i] = c;
            sin_t[i] = s;
        }
        for (r, decay) in rates.iter().zip(&decays) {
            if let Some((_, rss)) = problem.solve_with(decay, &cos_t, &sin_t) {
                if best.map_or(true, |(_, _, b)| rss < b) {
                    best = Some((f, *r, rss));
                }
            }
        }
    }

    let (mut f, mut r, mut rss) =
        best.ok_or_else(|| ThermometryError::FitFailed("no solvable grid point".into()))?;

    for _ in 0..settings.refine_rounds {
        let lo = (f - settings.freq_step_hz).max(settings.freq_min_hz);
        let hi = (f + settings.freq_step_hz).min(settings.freq_max_hz);
        let (f_new, rss_new) = golden_section(lo, hi, |x| problem.rss(x, r));
        if rss_new <= rss {
            f = f_new;
            rss = rss_new;
        }

        if settings.r2star_step > 0.0 && settings.r2star_max > 0.0 {
            let lo = (r - settings.r2star_step).max(0.0);
            let hi = (r + settings.r2star_step).min(settings.r2star_max);
            let (r_new, rss_new) = golden_section(lo, hi, |x| problem.rss(f, x));
            if rss_new <= rss {
                r = r_new;
                rss = rss_new;
            }
        }
    }

    let (coefficients, rss) = problem
        .solve(f, r)
        .ok_or_else(|| ThermometryError::FitFailed("singular system at optimum".into()))?;

    let mean = y.iter().sum::<f64>() / y.len() as f64;
    let sst: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    let r_squared = if sst > 0.0 { 1.0 - rss / sst } else { 0.0 };

    Ok(BeatFit {
        delta_f_hz: f,
        r2star_per_s: r,
        coefficients,
        rss,
        r_squared,
    })
}

fn validate_settings(s: &FitSettings) -> ThermometryResult<()> {
    let ok = s.freq_min_hz.is_finite()
        && s.freq_max_hz.is_finite()
        && s.freq_min_hz <= s.freq_max_hz
        && s.freq_step_hz > 0.0
        && s.r2star_max >= 0.0
        && s.r2star_step > 0.0;
    if ok {
        Ok(())
    } else {
        Err(ThermometryError::FitFailed(format!("invalid search settings {s:?}")))
    }
}

/// Inclusive grid from `lo` to `hi` in steps of `step`.
fn grid(lo: f64, hi: f64, step: f64) -> Vec<f64> {
    let n = ((hi - lo) / step + 1e-9).floor() as usize + 1;
    (0..n).map(|i| lo + i as f64 * step).collect()
}

struct Problem<'a> {
    te_s: &'a [f64],
    y: &'a [f64],
}

impl Problem<'_> {
    fn rss(&self, f: f64, r: f64) -> f64 {
        self.solve(f, r).map_or(f64::INFINITY, |(_, rss)| rss)
    }

    fn solve(&self, f: f64, r: f64) -> Option<([f64; 3], f64)> {
        let decay: Vec<f64> = self.te_s.iter().map(|t| (-2.0 * r * t).exp()).collect();
        let (sin_t, cos_t): (Vec<f64>, Vec<f64>) =
            self.te_s.iter().map(|t| (2.0 * PI * f * t).sin_cos()).unzip();
        self.solve_with(&decay, &cos_t, &sin_t)
    }

    /// Linear least squares for `(a, b, c)` given the basis ingredients.
    fn solve_with(&self, decay: &[f64], cos_t: &[f64], sin_t: &[f64]) -> Option<([f64; 3], f64)> {
        let mut ata = [[0.0f64; 3]; 3];
        let mut aty = [0.0f64; 3];
        for i in 0..self.y.len() {
            let g = [decay[i], decay[i] * cos_t[i], decay[i] * sin_t[i]];
            for r in 0..3 {
                aty[r] += g[r] * self.y[i];
                for c in r..3 {
                    ata[r][c] += g[r] * g[c];
                }
            }
        }
        for r in 1..3 {
            for c in 0..r {
                ata[r][c] = ata[c][r];
            }
        }

        let x = solve3(ata, aty)?;
        let rss = (0..self.y.len())
            .map(|i| {
                let model = decay[i] * (x[0] + x[1] * cos_t[i] + x[2] * sin_t[i]);
                (self.y[i] - model).powi(2)
            })
            .sum();
        Some((x, rss))
    }
}

/// Gaussian elimination with partial pivoting; `None` when singular.
fn solve3(mut a: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    let scale = a[0][0].abs().max(a[1][1].abs()).max(a[2][2].abs());
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let tol = scale * 1e-12;

    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < tol {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..3 {
            let factor = a[row][col] / a[col][col];
            for k in col..3 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Minimise `f` on `[lo, hi]`; returns the best abscissa and value seen.
fn golden_section(lo: f64, hi: f64, mut f: impl FnMut(f64) -> f64) -> (f64, f64) {
    const INV_PHI: f64 = 0.618_033_988_749_894_8;

    let (mut a, mut b) = (lo, hi);
    let mut c = b - INV_PHI * (b - a);
    let mut d = a + INV_PHI * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);

    for _ in 0..GOLDEN_ITERATIONS {
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - INV_PHI * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + INV_PHI * (b - a);
            fd = f(d);
        }
    }

    if fc < fd {
        (c, fc)
    } else {
        (d, fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn settings() -> FitSettings {
        FitSettings {
            freq_min_hz: 80.0,
            freq_max_hz: 260.0,
            freq_step_hz: 1.0,
            r2star_max: 60.0,
            r2star_step: 5.0,
            refine_rounds: 3,
        }
    }

    fn echo_times() -> Vec<f64> {
        (0..24).map(|i| 0.0016 + 0.0008 * i as f64).collect()
    }

    /// |A + B·exp(i·2πΔf·t)|² · exp(-2·R2*·t)
    fn two_peak_signal(te: &[f64], delta_f: f64, r2star: f64) -> Vec<f64> {
        let (a, b) = (2.0 / 3.0, 1.0 / 3.0);
        te.iter()
            .map(|t| {
                let w = 2.0 * PI * delta_f * t;
                (-2.0 * r2star * t).exp() * (a * a + b * b + 2.0 * a * b * w.cos())
            })
            .collect()
    }

    #[test]
    fn recovers_noiseless_parameters() {
        let te = echo_times();
        let y = two_peak_signal(&te, 173.4, 22.0);
        let fit = fit_beat(&te, &y, &settings()).unwrap();

        assert_abs_diff_eq!(fit.delta_f_hz, 173.4, epsilon = 0.05);
        assert_abs_diff_eq!(fit.r2star_per_s, 22.0, epsilon = 0.5);
        assert!(fit.r_squared > 0.999, "r² = {}", fit.r_squared);
        // a = A² + B², b = 2AB, c = 0 for A = 2/3, B = 1/3
        let [a, b, c] = fit.coefficients;
        assert_abs_diff_eq!(a, 5.0 / 9.0, epsilon = 1e-2);
        assert_abs_diff_eq!(b, 4.0 / 9.0, epsilon = 1e-2);
        assert_abs_diff_eq!(c, 0.0, epsilon = 1e-2);
    }

    #[test]
    fn grid_edges_are_searchable() {
        let te = echo_times();
        let y = two_peak_signal(&te, 80.0, 0.0);
        let fit = fit_beat(&te, &y, &settings()).unwrap();
        assert_abs_diff_eq!(fit.delta_f_hz, 80.0, epsilon = 0.05);
        assert_abs_diff_eq!(fit.r2star_per_s, 0.0, epsilon = 0.5);
    }

    #[test]
    fn rejects_short_or_mismatched_input() {
        let s = settings();
        assert!(matches!(
            fit_beat(&[0.001, 0.002], &[1.0, 2.0], &s),
            Err(ThermometryError::InsufficientEchoes { found: 2, .. })
        ));
        assert!(matches!(
            fit_beat(&echo_times(), &[1.0; 3], &s),
            Err(ThermometryError::LengthMismatch { echo_times: 24, samples: 3 })
        ));
        let mut y = two_peak_signal(&echo_times(), 150.0, 10.0);
        y[4] = f64::NAN;
        assert!(matches!(
            fit_beat(&echo_times(), &y, &s),
            Err(ThermometryError::FitFailed(_))
        ));
    }

    #[test]
    fn constant_signal_reports_zero_r_squared() {
        let te = echo_times();
        let fit = fit_beat(&te, &vec![5.0; te.len()], &settings()).unwrap();
        assert_eq!(fit.r_squared, 0.0);
    }

    #[test]
    fn solve3_detects_singular_systems() {
        let singular = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [1.0, 1.0, 1.0]];
        assert!(solve3(singular, [1.0, 2.0, 3.0]).is_none());

        let x = solve3([[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [1.0, 0.0, 1.0]], [2.0, 8.0, 4.0]).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[2], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn grid_is_inclusive() {
        assert_eq!(grid(0.0, 10.0, 5.0), vec![0.0, 5.0, 10.0]);
        assert_eq!(grid(1.0, 1.0, 0.5), vec![1.0]);
    }
}
