use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use palette::{Hsl, IntoColor, Srgb};

// ---------------------------------------------------------------------------
// Temperature colour scale
// ---------------------------------------------------------------------------

/// Maps temperatures onto a blue (cold) → red (hot) hue ramp. Values outside
/// the range are clamped; NaN is black.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureColorMap {
    pub min_c: f64,
    pub max_c: f64,
}

impl TemperatureColorMap {
    pub fn new(min_c: f64, max_c: f64) -> Self {
        TemperatureColorMap { min_c, max_c }
    }

    /// Look up the colour for a temperature.
    pub fn color_for(&self, temperature_c: f32) -> Rgb<u8> {
        if !temperature_c.is_finite() {
            return Rgb([0, 0, 0]);
        }
        let span = (self.max_c - self.min_c).max(f64::EPSILON);
        let frac = ((temperature_c as f64 - self.min_c) / span).clamp(0.0, 1.0) as f32;
        let hue = 240.0 * (1.0 - frac);
        let hsl = Hsl::new(hue, 0.85, 0.5);
        let rgb: Srgb = hsl.into_color();
        Rgb([
            (rgb.red * 255.0).round() as u8,
            (rgb.green * 255.0).round() as u8,
            (rgb.blue * 255.0).round() as u8,
        ])
    }
}

// ---------------------------------------------------------------------------
// Slice rendering
// ---------------------------------------------------------------------------

/// Render axial slice `z` of a map on `grid`. Image rows run from high y to
/// low y so anterior is up for RAS-oriented data.
pub fn render_slice(map: &[f32], grid: [usize; 3], z: usize, cmap: &TemperatureColorMap) -> RgbImage {
    let [nx, ny, _] = grid;
    let offset = z * nx * ny;
    RgbImage::from_fn(nx as u32, ny as u32, |col, row| {
        let x = col as usize;
        let y = ny - 1 - row as usize;
        cmap.color_for(map[offset + x + nx * y])
    })
}

/// Write one PNG per axial slice as `<prefix>_slice-ZZZ.png` in `dir`.
pub fn write_slices(
    dir: &Path,
    prefix: &str,
    map: &[f32],
    grid: [usize; 3],
    cmap: &TemperatureColorMap,
) -> Result<Vec<PathBuf>> {
    (0..grid[2])
        .map(|z| {
            let path = dir.join(format!("{prefix}_slice-{z:03}.png"));
            render_slice(map, grid, z, cmap)
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ramp_runs_blue_to_red() {
        let cmap = TemperatureColorMap::new(0.0, 60.0);
        let cold = cmap.color_for(-5.0);
        let hot = cmap.color_for(90.0);
        assert!(cold[2] > cold[0], "{cold:?}");
        assert!(hot[0] > hot[2], "{hot:?}");
        assert_eq!(cmap.color_for(f32::NAN), Rgb([0, 0, 0]));
        assert_eq!(cmap.color_for(0.0), cold);
    }

    #[test]
    fn slices_are_written_per_z() {
        let dir = TempDir::new().unwrap();
        let grid = [3, 2, 2];
        let mut map = vec![f32::NAN; 12];
        map[0] = 10.0; // x=0, y=0, z=0 → bottom-left pixel
        let cmap = TemperatureColorMap::new(0.0, 60.0);

        let paths = write_slices(dir.path(), "run-01_thermometry", &map, grid, &cmap).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[1].ends_with("run-01_thermometry_slice-001.png"));

        let img = image::open(&paths[0]).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(*img.get_pixel(0, 1), cmap.color_for(10.0));
        assert_eq!(*img.get_pixel(0, 0), Rgb([0, 0, 0]));
    }
}
