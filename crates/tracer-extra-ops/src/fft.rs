//! # Frequency-domain high-pass filtering
//!
//! Feature maps are moved to the host, transformed plane by plane with a 2-D
//! FFT, stripped of every frequency inside a centred disc and transformed back.
//! The magnitude of the inverse transform is returned.
//!
//! The disc is defined on the centre-shifted spectrum. Instead of shifting
//! the spectrum and shifting it back, the disc is mapped onto the unshifted
//! layout, which yields the same values.

use std::sync::Arc;

use burn::{prelude::*, tensor::TensorData};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Builds the low-frequency disc for a centre-shifted `rows x cols` spectrum.
///
/// The value at `(i, j)` is `1.0` when
/// `sqrt((i - rows / 2)^2 + (j - rows / 2)^2) < radius` and `0.0` otherwise.
/// Both axes are centred on `rows / 2`, so on non-square maps the disc sits
/// on the row centre of each axis.
pub fn radial_mask(rows: usize, cols: usize, radius: f64) -> Vec<f32> {
    let centre = rows as f64 / 2.0;
    let mut mask = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            let di = i as f64 - centre;
            let dj = j as f64 - centre;
            let inside = (di * di + dj * dj).sqrt() < radius;
            mask.push(if inside { 1.0 } else { 0.0 });
        }
    }
    mask
}

/// Per-position keep flags on the unshifted spectrum layout.
fn high_pass_keep(rows: usize, cols: usize, radius: f64) -> Vec<bool> {
    let mask = radial_mask(rows, cols, radius);
    let mut keep = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        let shifted_i = (i + rows / 2) % rows;
        for j in 0..cols {
            let shifted_j = (j + cols / 2) % cols;
            keep.push(mask[shifted_i * cols + shifted_j] == 0.0);
        }
    }
    keep
}

struct Plan2d {
    rows: usize,
    cols: usize,
    row_fft: Arc<dyn Fft<f32>>,
    col_fft: Arc<dyn Fft<f32>>,
    column: Vec<Complex<f32>>,
}

impl Plan2d {
    fn new(planner: &mut FftPlanner<f32>, rows: usize, cols: usize, inverse: bool) -> Self {
        let (row_fft, col_fft) = if inverse {
            (planner.plan_fft_inverse(cols), planner.plan_fft_inverse(rows))
        } else {
            (planner.plan_fft_forward(cols), planner.plan_fft_forward(rows))
        };
        Self {
            rows,
            cols,
            row_fft,
            col_fft,
            column: vec![Complex::default(); rows],
        }
    }

    fn process(&mut self, plane: &mut [Complex<f32>]) {
        // rustfft transforms every `cols`-long chunk of the buffer.
        self.row_fft.process(plane);

        for j in 0..self.cols {
            for i in 0..self.rows {
                self.column[i] = plane[i * self.cols + j];
            }
            self.col_fft.process(&mut self.column);
            for i in 0..self.rows {
                plane[i * self.cols + j] = self.column[i];
            }
        }
    }
}

/// Removes every frequency within `radius` of the spectrum centre from each
/// `[height, width]` plane of `x` and returns the magnitude of what remains.
///
/// The mask is rebuilt on every call for the current spatial size.
pub fn high_pass_filter<B: Backend>(x: Tensor<B, 4>, radius: f64) -> Tensor<B, 4> {
    let device = x.device();
    let [batch, channels, rows, cols] = x.dims();
    let plane_len = rows * cols;
    if plane_len == 0 {
        return x;
    }

    let values: Vec<f32> = x.into_data().iter::<f32>().collect();
    let keep = high_pass_keep(rows, cols, radius);

    let mut planner = FftPlanner::new();
    let mut forward = Plan2d::new(&mut planner, rows, cols, false);
    let mut inverse = Plan2d::new(&mut planner, rows, cols, true);
    let norm = 1.0 / plane_len as f32;

    let mut plane = vec![Complex::default(); plane_len];
    let mut output = Vec::with_capacity(values.len());
    for chunk in values.chunks_exact(plane_len) {
        for (z, v) in plane.iter_mut().zip(chunk) {
            *z = Complex::new(*v, 0.0);
        }
        forward.process(&mut plane);
        for (z, keep) in plane.iter_mut().zip(&keep) {
            if !keep {
                *z = Complex::default();
            }
        }
        inverse.process(&mut plane);
        output.extend(plane.iter().map(|z| z.norm() * norm));
    }

    Tensor::from_data(
        TensorData::new(output, [batch, channels, rows, cols]).convert::<B::FloatElem>(),
        &device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn radial_mask_is_radially_symmetric() {
        for radius in [1.0, 2.5, 4.0, 16.0] {
            let size = 12;
            let mask = radial_mask(size, size, radius);
            let centre = size as f64 / 2.0;
            for i in 0..size {
                for j in 0..size {
                    let d = ((i as f64 - centre).powi(2) + (j as f64 - centre).powi(2)).sqrt();
                    for k in 0..size {
                        for l in 0..size {
                            let e = ((k as f64 - centre).powi(2) + (l as f64 - centre).powi(2))
                                .sqrt();
                            if (d - e).abs() < 1e-12 {
                                assert_eq!(mask[i * size + j], mask[k * size + l]);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn radial_mask_covers_points_inside_radius() {
        let mask = radial_mask(8, 8, 2.0);

        assert_eq!(mask[4 * 8 + 4], 1.0);
        assert_eq!(mask[4 * 8 + 5], 1.0);
        // distance exactly 2 is outside
        assert_eq!(mask[4 * 8 + 6], 0.0);
        assert_eq!(mask[0], 0.0);
        assert_eq!(mask.iter().filter(|v| **v == 1.0).count(), 9);
    }

    #[test]
    fn high_pass_of_constant_field_is_zero() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 2, 8, 8], &device) * 3.0;

        let output = high_pass_filter(x, 2.0).into_data().to_vec::<f32>().unwrap();

        assert!(output.iter().all(|v| v.abs() < 1e-5), "got {output:?}");
    }

    #[test]
    fn high_pass_with_zero_radius_returns_magnitude() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats(
            [1.0, -2.0, 3.0, -4.0, 5.0, -6.0, 7.0, -8.0, 9.0],
            &device,
        )
        .reshape([1, 1, 3, 3]);

        let output = high_pass_filter(x.clone(), 0.0)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let expected = x.abs().into_data().to_vec::<f32>().unwrap();

        for (a, e) in output.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-4, "expected {expected:?}, got {output:?}");
        }
    }

    #[test]
    fn high_pass_removes_low_frequency_component() {
        let device = Default::default();
        let rows = 8;
        let cols = 8;
        // constant offset plus the highest vertical frequency
        let data: Vec<f32> = (0..rows * cols)
            .map(|k| 5.0 + if (k / cols) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(data, [1, 1, rows, cols]),
            &device,
        );

        let output = high_pass_filter(x, 2.0).into_data().to_vec::<f32>().unwrap();

        assert!(output.iter().all(|v| (v - 1.0).abs() < 1e-4), "got {output:?}");
    }
}
