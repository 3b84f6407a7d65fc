use crate::data::nifti::Volume;
use crate::error::{ThermometryError, ThermometryResult};

/// One series image with its echo times in seconds.
#[derive(Debug, Clone)]
pub struct SeriesImage {
    pub series_no: i64,
    pub te_s: Vec<f64>,
    pub volume: Volume,
}

/// Location of one echo inside the stack's series images.
#[derive(Debug, Clone, Copy)]
struct EchoRef {
    te_s: f64,
    image: usize,
    frame: usize,
}

/// All echoes of a run, across its series, ordered by echo time.
#[derive(Debug, Clone)]
pub struct EchoStack {
    images: Vec<SeriesImage>,
    echoes: Vec<EchoRef>,
    grid: [usize; 3],
}

impl EchoStack {
    /// Combine series images on a common `grid`.
    ///
    /// Every image must have one frame per listed echo time and the same
    /// spatial grid as the segmentation.
    pub fn assemble(images: Vec<SeriesImage>, grid: [usize; 3]) -> ThermometryResult<Self> {
        let mut echoes = Vec::new();
        for (idx, image) in images.iter().enumerate() {
            if image.volume.grid() != grid {
                return Err(ThermometryError::GridMismatch {
                    expected: grid,
                    found: image.volume.grid(),
                });
            }
            if image.volume.frames() != image.te_s.len() {
                return Err(ThermometryError::EchoCountMismatch {
                    series_no: image.series_no,
                    expected: image.te_s.len(),
                    found: image.volume.frames(),
                });
            }
            echoes.extend(image.te_s.iter().enumerate().map(|(frame, &te_s)| EchoRef {
                te_s,
                image: idx,
                frame,
            }));
        }
        echoes.sort_by(|a, b| a.te_s.total_cmp(&b.te_s));

        Ok(EchoStack {
            images,
            echoes,
            grid,
        })
    }

    /// Echo times in seconds, ascending.
    pub fn echo_times(&self) -> Vec<f64> {
        self.echoes.iter().map(|e| e.te_s).collect()
    }

    pub fn echo_count(&self) -> usize {
        self.echoes.len()
    }

    pub fn grid(&self) -> [usize; 3] {
        self.grid
    }

    /// Series numbers in input order.
    pub fn series_numbers(&self) -> Vec<i64> {
        self.images.iter().map(|img| img.series_no).collect()
    }

    /// Squared magnitude of one voxel at every echo.
    pub fn voxel_signal_sq(&self, voxel: usize) -> Vec<f64> {
        self.echoes
            .iter()
            .map(|e| {
                let s = self.images[e.image].volume.sample(voxel, e.frame) as f64;
                s * s
            })
            .collect()
    }

    /// Mean squared magnitude over `voxels` at every echo. Voxels may repeat.
    pub fn mean_signal_sq(&self, voxels: &[usize]) -> Vec<f64> {
        if voxels.is_empty() {
            return vec![0.0; self.echoes.len()];
        }
        let n = voxels.len() as f64;
        self.echoes
            .iter()
            .map(|e| {
                let volume = &self.images[e.image].volume;
                let frame = volume.frame(e.frame);
                voxels
                    .iter()
                    .map(|&v| {
                        let s = frame[v] as f64;
                        s * s
                    })
                    .sum::<f64>()
                    / n
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::nifti::Geometry;

    fn image(series_no: i64, te_s: &[f64], grid: [usize; 3], base: f32) -> SeriesImage {
        let frames = te_s.len();
        let n = grid.iter().product::<usize>();
        let data = (0..n * frames)
            .map(|i| base + (i / n) as f32 + (i % n) as f32 * 0.1)
            .collect();
        SeriesImage {
            series_no,
            te_s: te_s.to_vec(),
            volume: Volume {
                dims: [grid[0], grid[1], grid[2], frames],
                geometry: Geometry::default(),
                data,
            },
        }
    }

    #[test]
    fn interleaves_series_by_echo_time() {
        let grid = [2, 1, 1];
        let stack = EchoStack::assemble(
            vec![
                image(1, &[0.002, 0.004], grid, 10.0),
                image(2, &[0.001, 0.003], grid, 20.0),
            ],
            grid,
        )
        .unwrap();

        assert_eq!(stack.echo_times(), vec![0.001, 0.002, 0.003, 0.004]);
        assert_eq!(stack.series_numbers(), vec![1, 2]);
        // voxel 0: series 2 frame 0, series 1 frame 0, series 2 frame 1, series 1 frame 1
        let v0: Vec<f64> = stack.voxel_signal_sq(0);
        assert_eq!(v0, vec![400.0, 100.0, 441.0, 121.0]);
    }

    #[test]
    fn mean_signal_allows_repeated_voxels() {
        let grid = [2, 1, 1];
        let stack = EchoStack::assemble(vec![image(1, &[0.001], grid, 1.0)], grid).unwrap();
        // voxel values 1.0 and 1.1
        let mean = stack.mean_signal_sq(&[0, 0, 1]);
        let expected = (1.0 + 1.0 + 1.1f32 as f64 * 1.1f32 as f64) / 3.0;
        assert!((mean[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn rejects_mismatched_grid_and_echo_count() {
        let grid = [2, 2, 1];
        assert!(matches!(
            EchoStack::assemble(vec![image(1, &[0.001], [2, 1, 1], 0.0)], grid),
            Err(ThermometryError::GridMismatch { .. })
        ));

        let mut bad = image(4, &[0.001, 0.002], grid, 0.0);
        bad.te_s.push(0.003);
        assert!(matches!(
            EchoStack::assemble(vec![bad], grid),
            Err(ThermometryError::EchoCountMismatch {
                series_no: 4,
                expected: 3,
                found: 2
            })
        ));
    }
}
