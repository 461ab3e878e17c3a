//! Scaled exponential linear unit.

use burn::prelude::*;

const SELU_ALPHA: f64 = 1.673_263_242_354_377_3;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;

/// Applies `scale * (max(0, x) + min(0, alpha * (exp(x) - 1)))` element-wise.
pub fn selu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let positive = x.clone().clamp_min(0.0);
    let negative = (x.clamp_max(0.0).exp() - 1.0) * SELU_ALPHA;
    (positive + negative) * SELU_SCALE
}

/// SELU activation as a parameterless module.
#[derive(Module, Clone, Debug, Default)]
pub struct Selu;

impl Selu {
    /// Create the module.
    pub const fn new() -> Self {
        Self
    }

    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        selu(x)
    }
}
