//! Additional operations for the Burn deep learning framework
//!
//! This crate provides the tensor operations TRACER needs that are not
//! available in the core Burn framework: the SELU activation, drop connect,
//! bilinear resizing with an explicit corner-alignment mode, linear
//! quantiles and an FFT based high-pass filter.

use burn::prelude::*;

mod drop_connect;
mod fft;
mod interpolate;
mod quantile;
mod selu;

// Convenient re-exports
#[doc(inline)]
pub use drop_connect::drop_connect;
#[doc(inline)]
pub use fft::{high_pass_filter, radial_mask};
#[doc(inline)]
pub use interpolate::{resize_bilinear, upsample_bilinear};
#[doc(inline)]
pub use quantile::quantile;
#[doc(inline)]
pub use selu::{selu, Selu};

/// Additional operations for Burn tensors
pub trait TensorExtraOps<B: Backend, const D: usize> {
    /// Apply drop connect (stochastic depth) to the tensor
    fn drop_connect(self, rate: f64, training: bool) -> Self;

    /// Apply the SELU activation
    fn selu(self) -> Self;
}

impl<B: Backend, const D: usize> TensorExtraOps<B, D> for Tensor<B, D> {
    fn drop_connect(self, rate: f64, training: bool) -> Self {
        drop_connect(self, rate, training)
    }

    fn selu(self) -> Self {
        selu(self)
    }
}
