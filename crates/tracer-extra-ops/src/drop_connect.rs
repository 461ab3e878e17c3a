//! # Drop connect
//!
//! Stochastic depth for residual branches. During training, whole samples of
//! the batch are zeroed with probability `rate` and the survivors are scaled
//! by `1 / (1 - rate)` so the expected activation is unchanged. Outside of
//! training the input is returned as is.

use burn::{prelude::*, tensor::Distribution};

/// Applies drop connect to `x`.
///
/// The keep mask has shape `[batch, 1, ...]` and is broadcast over all other
/// dimensions, so every sample is either kept entirely or dropped entirely.
///
/// # Panics
///
/// Panics if `rate` is not in `[0, 1)`.
pub fn drop_connect<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    rate: f64,
    training: bool,
) -> Tensor<B, D> {
    assert!(
        (0.0..1.0).contains(&rate),
        "drop connect rate must be in [0, 1), got {rate}"
    );
    if !training || rate == 0.0 {
        return x;
    }

    let keep_prob = 1.0 - rate;
    let mut mask_shape = [1; D];
    mask_shape[0] = x.dims()[0];

    let mask = Tensor::random(mask_shape, Distribution::Bernoulli(keep_prob), &x.device());
    x / keep_prob * mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn drop_connect_is_identity_outside_training() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &device);

        let output = drop_connect(x.clone(), 0.5, false);

        let diff = (output - x).abs().sum().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn drop_connect_zero_rate_is_identity() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &device);

        let output = drop_connect(x.clone(), 0.0, true);

        let diff = (output - x).abs().sum().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn drop_connect_drops_or_rescales_whole_samples() {
        let device = Default::default();
        let batch_size = 8;
        let x = Tensor::<TestBackend, 4>::ones([batch_size, 2, 3, 3], &device);

        let output = drop_connect(x, 0.5, true);

        for i in 0..batch_size {
            let sample = output.clone().slice([i..i + 1, 0..2, 0..3, 0..3]);
            let values = sample.into_data().to_vec::<f32>().unwrap();
            let first = values[0];
            assert!(
                first == 0.0 || (first - 2.0).abs() < 1e-6,
                "unexpected value {first}"
            );
            assert!(values.iter().all(|v| *v == first), "sample {i} was partially dropped");
        }
    }

    #[test]
    #[should_panic(expected = "drop connect rate")]
    fn drop_connect_rejects_rate_of_one() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::ones([2, 2], &device);
        let _ = drop_connect(x, 1.0, true);
    }
}
