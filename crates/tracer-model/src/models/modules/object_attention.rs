//! Object attention: refines a decoder map with encoder features gated by the
//! map's own foreground and background confidence.

use burn::{prelude::*, tensor::activation::sigmoid};

use super::conv::{DilatedHead, DilatedHeadConfig};
use crate::{
    error::TracerResult,
    weights::{LoadWeights, WeightStore},
};

/// Configuration for [`ObjectAttention`].
#[derive(Config, Debug)]
pub struct ObjectAttentionConfig {
    /// Channels of the encoder features.
    channels: usize,
    #[config(default = "3")]
    kernel_size: usize,
    /// Background gate values above this threshold are dropped.
    #[config(default = "0.93")]
    denoise: f64,
}

impl ObjectAttentionConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ObjectAttention<B> {
        let head = DilatedHeadConfig::new(self.channels, self.channels / 2)
            .with_kernel_size(self.kernel_size)
            .init(device);

        ObjectAttention {
            head,
            denoise: self.denoise,
        }
    }
}

/// # Shapes
///   - decoder_map: `[batch_size, 1, height, width]`
///   - encoder_map: `[batch_size, channels, height, width]`
///   - output: `[batch_size, 1, height, width]`
#[derive(Module, Debug)]
pub struct ObjectAttention<B: Backend> {
    head: DilatedHead<B>,
    denoise: f64,
}

impl<B: Backend> ObjectAttention<B> {
    pub fn forward(&self, decoder_map: Tensor<B, 4>, encoder_map: Tensor<B, 4>) -> Tensor<B, 4> {
        let object = sigmoid(decoder_map.clone());
        let background = object.clone().neg() + 1.0;
        let noisy = background.clone().greater_elem(self.denoise);
        let background = background.mask_fill(noisy, 0.0);

        let x = object * encoder_map.clone() + background * encoder_map;

        self.head.forward(x) + decoder_map
    }
}

impl<B: Backend> LoadWeights for ObjectAttention<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.head = self.head.load_weights_with_output(store, prefix, "conv1")?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn output_is_residual_on_decoder_map() {
        let device = Default::default();
        let attention = ObjectAttentionConfig::new(16).init::<TestBackend>(&device);
        let decoder = Tensor::<TestBackend, 4>::random([1, 1, 8, 8], Distribution::Default, &device);
        let encoder = Tensor::<TestBackend, 4>::random([1, 16, 8, 8], Distribution::Default, &device);

        let output = attention.forward(decoder.clone(), encoder);

        assert_eq!(output.dims(), [1, 1, 8, 8]);
        // the head ends in a ReLU, so the refinement never lowers the map
        let diff = (output - decoder).into_data().to_vec::<f32>().unwrap();
        assert!(diff.iter().all(|v| *v >= -1e-6));
    }
}
