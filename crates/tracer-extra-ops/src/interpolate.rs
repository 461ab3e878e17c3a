//! Bilinear resizing with an explicit corner-alignment mode.
//!
//! Burn's `interpolate` fixes the sampling grid. TRACER mixes both grids:
//! the aggregation decoder samples with aligned corners while every other
//! resize uses half-pixel centres. Both are expressed here as two separable
//! gather-and-blend passes, width first and then height.

use burn::{prelude::*, tensor::TensorData};

struct AxisTaps {
    lower: Vec<i64>,
    upper: Vec<i64>,
    lower_weight: Vec<f32>,
    upper_weight: Vec<f32>,
}

fn axis_taps(input: usize, output: usize, align_corners: bool) -> AxisTaps {
    let mut taps = AxisTaps {
        lower: Vec::with_capacity(output),
        upper: Vec::with_capacity(output),
        lower_weight: Vec::with_capacity(output),
        upper_weight: Vec::with_capacity(output),
    };

    for dst in 0..output {
        let src = if align_corners {
            if output > 1 {
                dst as f32 * (input - 1) as f32 / (output - 1) as f32
            } else {
                0.0
            }
        } else {
            let scale = input as f32 / output as f32;
            ((dst as f32 + 0.5) * scale - 0.5).max(0.0)
        };

        let lower = (src.floor() as usize).min(input - 1);
        let upper = (lower + 1).min(input - 1);
        let lambda = src - lower as f32;

        taps.lower.push(lower as i64);
        taps.upper.push(upper as i64);
        taps.lower_weight.push(1.0 - lambda);
        taps.upper_weight.push(lambda);
    }

    taps
}

fn resize_axis<B: Backend>(
    x: Tensor<B, 4>,
    dim: usize,
    output: usize,
    align_corners: bool,
) -> Tensor<B, 4> {
    let input = x.dims()[dim];
    if input == output {
        return x;
    }

    let device = x.device();
    let taps = axis_taps(input, output, align_corners);

    let index = |values: Vec<i64>| {
        Tensor::<B, 1, Int>::from_data(
            TensorData::new(values, [output]).convert::<B::IntElem>(),
            &device,
        )
    };
    let mut weight_shape = [1; 4];
    weight_shape[dim] = output;
    let weight = |values: Vec<f32>| {
        Tensor::<B, 1>::from_data(
            TensorData::new(values, [output]).convert::<B::FloatElem>(),
            &device,
        )
        .reshape(weight_shape)
    };

    let lower = x.clone().select(dim, index(taps.lower));
    let upper = x.select(dim, index(taps.upper));

    lower * weight(taps.lower_weight) + upper * weight(taps.upper_weight)
}

/// Resizes a `[batch, channels, height, width]` tensor to `size` with
/// bilinear sampling.
///
/// With `align_corners` the corner pixels of input and output coincide;
/// otherwise pixel centres are aligned and source coordinates are clamped at
/// zero.
pub fn resize_bilinear<B: Backend>(
    x: Tensor<B, 4>,
    size: [usize; 2],
    align_corners: bool,
) -> Tensor<B, 4> {
    let [height, width] = size;
    let x = resize_axis(x, 3, width, align_corners);
    resize_axis(x, 2, height, align_corners)
}

/// Upsamples by an integer factor on both spatial axes.
pub fn upsample_bilinear<B: Backend>(
    x: Tensor<B, 4>,
    scale_factor: usize,
    align_corners: bool,
) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    resize_bilinear(
        x,
        [height * scale_factor, width * scale_factor],
        align_corners,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    fn values(x: Tensor<TestBackend, 4>) -> Vec<f32> {
        x.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "expected {expected:?}, got {actual:?}");
        }
    }

    #[test]
    fn half_pixel_upsampling_matches_reference() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device).reshape([1, 1, 1, 2]);

        let output = resize_bilinear(x, [1, 4], false);

        assert_close(&values(output), &[0.0, 0.25, 0.75, 1.0]);
    }

    #[test]
    fn aligned_corner_upsampling_matches_reference() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device).reshape([1, 1, 1, 2]);

        let output = resize_bilinear(x, [1, 4], true);

        assert_close(&values(output), &[0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0]);
    }

    #[test]
    fn upsampling_both_axes_keeps_corners_when_aligned() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device)
            .reshape([1, 1, 2, 2]);

        let output = upsample_bilinear(x, 2, true);
        assert_eq!(output.dims(), [1, 1, 4, 4]);

        let output = values(output);
        assert_close(
            &[output[0], output[3], output[12], output[15]],
            &[1.0, 2.0, 3.0, 4.0],
        );
    }

    #[test]
    fn downsampling_with_half_pixel_grid_averages_pairs() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 2.0, 4.0, 6.0], &device)
            .reshape([1, 1, 1, 4]);

        let output = resize_bilinear(x, [1, 2], false);

        assert_close(&values(output), &[1.0, 5.0]);
    }

    #[test]
    fn same_size_is_a_no_op() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([3.0, 1.0, 4.0, 1.0], &device)
            .reshape([1, 1, 2, 2]);

        let output = resize_bilinear(x.clone(), [2, 2], false);

        assert_eq!(values(output), values(x));
    }
}
