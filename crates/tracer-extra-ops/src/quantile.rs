use burn::prelude::*;

/// Computes the `q`-th quantile along the last dimension of a `[rows, n]`
/// tensor with linear interpolation between the two nearest ranks.
///
/// Returns a `[rows, 1]` tensor.
///
/// # Panics
///
/// Panics if `q` is outside `[0, 1]` or the last dimension is empty.
pub fn quantile<B: Backend>(x: Tensor<B, 2>, q: f64) -> Tensor<B, 2> {
    assert!((0.0..=1.0).contains(&q), "quantile must be in [0, 1], got {q}");
    let [_, n] = x.dims();
    assert!(n > 0, "cannot take a quantile of an empty dimension");

    let sorted = x.sort(1);
    let rank = q * (n - 1) as f64;
    let below = rank.floor() as usize;
    let above = (rank.ceil() as usize).min(n - 1);
    let weight = rank - below as f64;

    let low = sorted.clone().narrow(1, below, 1);
    if above == below {
        return low;
    }
    let high = sorted.narrow(1, above, 1);

    // Same two-sided lerp as torch.lerp, which is exact at both ends.
    if weight < 0.5 {
        low.clone() + (high - low) * weight
    } else {
        high.clone() - (high - low) * (1.0 - weight)
    }
}
