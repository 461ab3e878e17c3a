//! # TRACER
//!
//! EfficientNet encoder with a frequency edge module, three receptive field
//! blocks, multi-level aggregation and two object-attention refinements.

use burn::{prelude::*, tensor::activation::sigmoid};
use tracer_extra_ops::upsample_bilinear;
use tracing::debug;

use super::{
    efficientnet::EfficientNet,
    modules::{
        Aggregation, AggregationConfig, ObjectAttention, ObjectAttentionConfig,
        ReceptiveFieldBlock, ReceptiveFieldBlockConfig,
    },
};
use crate::{
    error::{TracerError, TracerResult},
    weights::{join, LoadWeights, WeightStore},
};

/// Spatial sizes must be divisible by the total encoder stride.
const INPUT_MULTIPLE: usize = 32;

/// Configuration of the decoder half of [`Tracer`]. The backbone is built
/// separately and handed to [`TracerModelConfig::init`].
#[derive(Config, Debug)]
pub struct TracerModelConfig {
    /// Channels of the four backbone taps.
    channels: [usize; 4],
    #[config(default = "[32, 64, 128]")]
    rfb_channels: [usize; 3],
    #[config(default = "0.93")]
    denoise: f64,
    #[config(default = "0.1")]
    gamma: f64,
}

impl TracerModelConfig {
    pub fn init<B: Backend>(&self, backbone: EfficientNet<B>, device: &Device<B>) -> Tracer<B> {
        let rfb = |tap: usize, out: usize| {
            ReceptiveFieldBlockConfig::new(self.channels[tap], out).init(device)
        };
        let object_attention = |tap: usize| {
            ObjectAttentionConfig::new(self.channels[tap])
                .with_denoise(self.denoise)
                .init(device)
        };

        Tracer {
            model: backbone,
            rfb2: rfb(1, self.rfb_channels[0]),
            rfb3: rfb(2, self.rfb_channels[1]),
            rfb4: rfb(3, self.rfb_channels[2]),
            agg: AggregationConfig::new()
                .with_channels(self.rfb_channels)
                .with_confidence_ratio(self.gamma)
                .init(device),
            object_attention2: object_attention(1),
            object_attention1: object_attention(0),
        }
    }
}

/// Outputs of one forward pass, each passed through a sigmoid.
#[derive(Debug, Clone)]
pub struct TracerOutput<B: Backend> {
    /// Mean of the three deep-supervision maps: `[batch_size, 1, height, width]`.
    pub saliency: Tensor<B, 4>,
    /// Edge map from the frequency edge module: `[batch_size, 1, height, width]`.
    pub edge: Tensor<B, 4>,
    /// The aggregation map and the two object-attention refinements, each
    /// upsampled to the input resolution.
    pub deep_supervision: [Tensor<B, 4>; 3],
}

/// The TRACER salient object detection network.
#[derive(Module, Debug)]
pub struct Tracer<B: Backend> {
    model: EfficientNet<B>,
    rfb2: ReceptiveFieldBlock<B>,
    rfb3: ReceptiveFieldBlock<B>,
    rfb4: ReceptiveFieldBlock<B>,
    agg: Aggregation<B>,
    object_attention2: ObjectAttention<B>,
    object_attention1: ObjectAttention<B>,
}

impl<B: Backend> Tracer<B> {
    /// Runs the network in inference mode.
    ///
    /// # Shapes
    /// * `x` - Input tensor: `[batch_size, 3, height, width]`, with height and
    ///   width multiples of 32
    ///
    /// # Errors
    ///
    /// `InvalidTensorShape` if the input does not have three channels or a
    /// spatial size divisible by 32.
    pub fn forward(&self, x: Tensor<B, 4>) -> TracerResult<TracerOutput<B>> {
        self.forward_with(x, false)
    }

    /// Runs the network, applying stochastic depth when `training` is set.
    pub fn forward_with(&self, x: Tensor<B, 4>, training: bool) -> TracerResult<TracerOutput<B>> {
        let [batch, channels, height, width] = x.dims();
        if channels != 3 || height % INPUT_MULTIPLE != 0 || width % INPUT_MULTIPLE != 0 {
            return Err(TracerError::InvalidTensorShape {
                expected: "[batch, 3, 32k, 32k]".to_string(),
                actual: format!("[{batch}, {channels}, {height}, {width}]"),
            });
        }

        let features = self.model.forward(x, training);
        debug!(
            x1 = ?features.x1.dims(),
            x2 = ?features.x2.dims(),
            x3 = ?features.x3.dims(),
            x4 = ?features.x4.dims(),
            "backbone features"
        );

        let x2_rfb = self.rfb2.forward(features.x2.clone());
        let x3_rfb = self.rfb3.forward(features.x3);
        let x4_rfb = self.rfb4.forward(features.x4);

        let d0 = self.agg.forward(x4_rfb, x3_rfb, x2_rfb);
        let ds0 = upsample_bilinear(d0.clone(), 8, false);

        let d1 = self.object_attention2.forward(d0, features.x2);
        let ds1 = upsample_bilinear(d1.clone(), 8, false);

        let d1_up = upsample_bilinear(d1, 2, false);
        let d2 = self.object_attention1.forward(d1_up, features.x1);
        let ds2 = upsample_bilinear(d2, 4, false);

        let saliency = (ds0.clone() + ds1.clone() + ds2.clone()) / 3.0;

        Ok(TracerOutput {
            saliency: sigmoid(saliency),
            edge: sigmoid(features.edge),
            deep_supervision: [sigmoid(ds0), sigmoid(ds1), sigmoid(ds2)],
        })
    }
}

impl<B: Backend> LoadWeights for Tracer<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.model = self.model.load_weights(store, &join(prefix, "model"))?;
        self.rfb2 = self.rfb2.load_weights(store, &join(prefix, "rfb2"))?;
        self.rfb3 = self.rfb3.load_weights(store, &join(prefix, "rfb3"))?;
        self.rfb4 = self.rfb4.load_weights(store, &join(prefix, "rfb4"))?;
        self.agg = self.agg.load_weights(store, &join(prefix, "agg"))?;
        self.object_attention2 = self
            .object_attention2
            .load_weights(store, &join(prefix, "ObjectAttention2"))?;
        self.object_attention1 = self
            .object_attention1
            .load_weights(store, &join(prefix, "ObjectAttention1"))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::{config::TracerConfig, tests::TestBackend};

    fn small_b0() -> Tracer<TestBackend> {
        TracerConfig::new()
            .with_arch(0)
            .with_overrides(vec![("image_size".to_string(), 64.0)])
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn outputs_match_input_resolution_and_are_probabilities() {
        let device = Default::default();
        let model = small_b0();
        let x = Tensor::<TestBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);

        let output = model.forward(x).unwrap();

        assert_eq!(output.saliency.dims(), [1, 1, 64, 64]);
        assert_eq!(output.edge.dims(), [1, 1, 64, 64]);
        for map in output.deep_supervision {
            assert_eq!(map.dims(), [1, 1, 64, 64]);
        }
        let values = output.saliency.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn forward_is_deterministic() {
        let device = Default::default();
        let model = small_b0();
        let x = Tensor::<TestBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);

        let a = model.forward(x.clone()).unwrap().saliency;
        let b = model.forward(x).unwrap().saliency;

        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn rejects_sizes_not_divisible_by_32() {
        let device = Default::default();
        let model = small_b0();

        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 48, 64], &device);
        assert!(matches!(
            model.forward(x),
            Err(TracerError::InvalidTensorShape { .. })
        ));

        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 64, 64], &device);
        assert!(matches!(
            model.forward(x),
            Err(TracerError::InvalidTensorShape { .. })
        ));
    }
}
