//! # Frequency edge module
//!
//! Extracts an edge map from the high-frequency content of the first tapped
//! feature map and adds it back to the features.

use burn::prelude::*;
use tracer_extra_ops::high_pass_filter;

use super::{
    attention::{UnionAttention, UnionAttentionConfig},
    conv::{DilatedHead, DilatedHeadConfig},
};
use crate::{
    error::TracerResult,
    weights::{join, LoadWeights, WeightStore},
};

/// Configuration for [`FrequencyEdgeModule`].
#[derive(Config, Debug)]
pub struct FrequencyEdgeModuleConfig {
    channels: usize,
    /// Radius of the low-frequency disc removed before edge extraction.
    #[config(default = "16.0")]
    radius: f64,
    #[config(default = "0.1")]
    confidence_ratio: f64,
}

impl FrequencyEdgeModuleConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> FrequencyEdgeModule<B> {
        let attention = UnionAttentionConfig::new(self.channels)
            .with_confidence_ratio(self.confidence_ratio)
            .with_channel_only(true)
            .init(device);
        let head = DilatedHeadConfig::new(self.channels, self.channels).init(device);

        FrequencyEdgeModule {
            attention,
            head,
            radius: self.radius,
        }
    }
}

/// High-pass filter, channel tracing and a dilated convolution head.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]`
///   - output: the refined features with the input shape, and the
///     `[batch_size, 1, height, width]` edge map
#[derive(Module, Debug)]
pub struct FrequencyEdgeModule<B: Backend> {
    attention: UnionAttention<B>,
    head: DilatedHead<B>,
    radius: f64,
}

impl<B: Backend> FrequencyEdgeModule<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let high = high_pass_filter(x.clone(), self.radius);
        let (high, _) = self.attention.channel_tracer(high);
        let edge = self.head.forward(high);

        (x + edge.clone(), edge)
    }
}

impl<B: Backend> LoadWeights for FrequencyEdgeModule<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.attention = self.attention.load_weights(store, &join(prefix, "UAM"))?;
        self.head = self.head.load_weights_with_output(store, prefix, "conv")?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn zero_input_gives_zero_edge() {
        let device = Default::default();
        let module = FrequencyEdgeModuleConfig::new(8).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 8, 16, 16], &device);

        let (output, edge) = module.forward(x);

        // freshly initialised batch-norms have zero bias, so nothing leaks in
        let edge = edge.into_data().to_vec::<f32>().unwrap();
        let output = output.into_data().to_vec::<f32>().unwrap();
        assert!(edge.iter().all(|v| v.abs() < 1e-6));
        assert!(output.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn edge_is_single_channel_and_non_negative() {
        let device = Default::default();
        let module = FrequencyEdgeModuleConfig::new(8)
            .with_radius(2.0)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 8, 12, 12], Distribution::Default, &device);

        let (output, edge) = module.forward(x);

        assert_eq!(output.dims(), [2, 8, 12, 12]);
        assert_eq!(edge.dims(), [2, 1, 12, 12]);
        let edge = edge.into_data().to_vec::<f32>().unwrap();
        assert!(edge.iter().all(|v| *v >= 0.0));
    }
}
