//! # EfficientNet trunk
//!
//! The stem and the scaled MBConv block list, extended with a frequency edge
//! module applied at the first feature tap. The trunk stops after the last
//! tap; the classification head is never built.

mod mbconv;
mod padding;
mod params;

use burn::{
    module::Ignored,
    nn::{BatchNorm, BatchNormConfig},
    prelude::*,
    tensor::activation::silu,
};
use tracer_extra_ops::resize_bilinear;

pub use mbconv::{MBConvBlock, MBConvBlockConfig};
pub use padding::{
    Conv2dSame, Conv2dSameConfig, DynamicSamePadding, MaxPool2dSame, MaxPool2dSameConfig, SamePad,
    SamePadding, StaticSamePadding,
};
pub use params::{
    output_image_size, round_filters, round_repeats, BlockArgs, BlockSchedule, BlockSpec,
    GlobalParams, DEFAULT_BLOCKS, OVERRIDE_KEYS,
};

use crate::{
    error::{TracerError, TracerResult},
    models::modules::{FrequencyEdgeModule, FrequencyEdgeModuleConfig},
    weights::{join, LoadWeights, WeightStore},
};

/// Checks that every tap names an existing block of the expected width.
///
/// # Errors
///
/// - `InvalidConfiguration` if the taps are not strictly increasing.
/// - `TapOutOfRange` if a tap is beyond the last block.
/// - `TapChannelMismatch` if a tapped block has a different width.
pub fn validate_taps(
    block_idx: &[usize; 4],
    channels: &[usize; 4],
    schedule: &BlockSchedule,
) -> TracerResult<()> {
    if block_idx.windows(2).any(|w| w[0] >= w[1]) {
        return Err(TracerError::InvalidConfiguration {
            reason: format!("Tap indices must be strictly increasing, got {block_idx:?}"),
        });
    }

    for (tap, (&index, &expected)) in block_idx.iter().zip(channels).enumerate() {
        let actual = schedule
            .output_channels(index)
            .ok_or(TracerError::TapOutOfRange {
                tap,
                index,
                block_count: schedule.len(),
            })?;
        if actual != expected {
            return Err(TracerError::TapChannelMismatch {
                tap,
                index,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Features captured from the trunk.
#[derive(Debug, Clone)]
pub struct BackboneFeatures<B: Backend> {
    /// First tap, after edge refinement.
    pub x1: Tensor<B, 4>,
    pub x2: Tensor<B, 4>,
    pub x3: Tensor<B, 4>,
    pub x4: Tensor<B, 4>,
    /// Edge map resized to the input resolution.
    pub edge: Tensor<B, 4>,
}

/// Configuration for [`EfficientNet`].
#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    params: GlobalParams,
    /// Block indices after which features are captured.
    block_idx: [usize; 4],
    /// Expected channels at each tap.
    channels: [usize; 4],
    #[config(default = "16.0")]
    frequency_radius: f64,
    #[config(default = "0.1")]
    confidence_ratio: f64,
}

impl EfficientNetConfig {
    /// Builds the trunk after validating the taps against the scaled schedule.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> TracerResult<EfficientNet<B>> {
        let schedule = BlockSchedule::build(&BlockArgs::efficientnet_defaults()?, &self.params);
        validate_taps(&self.block_idx, &self.channels, &schedule)?;

        let conv_stem = Conv2dSameConfig::new([3, schedule.stem_channels], 3)
            .with_stride(2)
            .with_image_size(schedule.stem_image_size)
            .init(device);
        let bn0 = BatchNormConfig::new(schedule.stem_channels)
            .with_momentum(self.params.torch_momentum())
            .with_epsilon(self.params.batch_norm_epsilon)
            .init(device);

        // Blocks after the last tap never contribute to the output.
        let last = self.block_idx[3];
        let blocks = schedule.blocks[..=last]
            .iter()
            .map(|spec| MBConvBlockConfig::from_spec(spec, &self.params).init(device))
            .collect();

        let frequency_edge = FrequencyEdgeModuleConfig::new(self.channels[0])
            .with_radius(self.frequency_radius)
            .with_confidence_ratio(self.confidence_ratio)
            .init(device);

        Ok(EfficientNet {
            conv_stem,
            bn0,
            blocks,
            frequency_edge,
            block_idx: Ignored(self.block_idx),
            block_count: schedule.len(),
            drop_connect_rate: self.params.drop_connect_rate,
        })
    }
}

/// EfficientNet stem and blocks with feature taps.
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    conv_stem: Conv2dSame<B>,
    bn0: BatchNorm<B, 2>,
    blocks: Vec<MBConvBlock<B>>,
    frequency_edge: FrequencyEdgeModule<B>,
    block_idx: Ignored<[usize; 4]>,
    /// Length of the full schedule; scales the stochastic depth rate.
    block_count: usize,
    drop_connect_rate: f64,
}

impl<B: Backend> EfficientNet<B> {
    /// Stem convolution, batch-norm and swish.
    pub fn initial_conv(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        silu(self.bn0.forward(self.conv_stem.forward(x)))
    }

    /// Runs the blocks on the stem output and captures the taps.
    ///
    /// `height` and `width` are the network input size the edge map is
    /// resized to.
    pub fn get_blocks(
        &self,
        x: Tensor<B, 4>,
        height: usize,
        width: usize,
        training: bool,
    ) -> BackboneFeatures<B> {
        let [i1, i2, i3, i4] = self.block_idx.0;
        let run = |x: Tensor<B, 4>, start: usize, end: usize| {
            self.blocks[start..=end]
                .iter()
                .zip(start..)
                .fold(x, |x, (block, idx)| {
                    let rate = self.drop_connect_rate * idx as f64 / self.block_count as f64;
                    block.forward(x, Some(rate), training)
                })
        };

        let x = run(x, 0, i1);
        let (x1, edge) = self.frequency_edge.forward(x);
        let edge = resize_bilinear(edge, [height, width], false);
        let x2 = run(x1.clone(), i1 + 1, i2);
        let x3 = run(x2.clone(), i2 + 1, i3);
        let x4 = run(x3.clone(), i3 + 1, i4);

        BackboneFeatures {
            x1,
            x2,
            x3,
            x4,
            edge,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, training: bool) -> BackboneFeatures<B> {
        let [_, _, height, width] = x.dims();
        let x = self.initial_conv(x);
        self.get_blocks(x, height, width, training)
    }

    /// Number of blocks built, up to and including the last tap.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl<B: Backend> LoadWeights for EfficientNet<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.conv_stem = self.conv_stem.load_weights(store, &join(prefix, "_conv_stem"))?;
        self.bn0 = self.bn0.load_weights(store, &join(prefix, "_bn0"))?;
        self.blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| block.load_weights(store, &join(prefix, &format!("_blocks.{i}"))))
            .collect::<TracerResult<_>>()?;
        self.frequency_edge = self
            .frequency_edge
            .load_weights(store, &join(prefix, "Frequency_Edge_Module1"))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::EfficientNetVariant, tests::TestBackend};

    fn b0_config() -> EfficientNetConfig {
        EfficientNetConfig::new(
            GlobalParams::for_variant(&EfficientNetVariant::B0).with_image_size(Some(64)),
            [2, 4, 10, 15],
            [24, 40, 112, 320],
        )
    }

    #[test]
    fn taps_have_expected_shapes() {
        let device = Default::default();
        let model = b0_config().init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 64, 64], &device);

        let features = model.forward(x, false);

        assert_eq!(model.num_blocks(), 16);
        assert_eq!(features.x1.dims(), [1, 24, 16, 16]);
        assert_eq!(features.x2.dims(), [1, 40, 8, 8]);
        assert_eq!(features.x3.dims(), [1, 112, 4, 4]);
        assert_eq!(features.x4.dims(), [1, 320, 2, 2]);
        assert_eq!(features.edge.dims(), [1, 1, 64, 64]);
    }

    #[test]
    fn tap_past_last_block_is_rejected() {
        let device = Default::default();
        let config = EfficientNetConfig::new(
            GlobalParams::for_variant(&EfficientNetVariant::B0),
            [2, 4, 10, 16],
            [24, 40, 112, 320],
        );

        let err = config.init::<TestBackend>(&device).unwrap_err();

        assert!(matches!(
            err,
            TracerError::TapOutOfRange {
                tap: 3,
                index: 16,
                block_count: 16
            }
        ));
    }

    #[test]
    fn tap_width_mismatch_is_rejected() {
        let device = Default::default();
        let config = EfficientNetConfig::new(
            GlobalParams::for_variant(&EfficientNetVariant::B0),
            [2, 4, 10, 15],
            [24, 48, 112, 320],
        );

        let err = config.init::<TestBackend>(&device).unwrap_err();

        assert!(matches!(
            err,
            TracerError::TapChannelMismatch {
                tap: 1,
                expected: 48,
                actual: 40,
                ..
            }
        ));
    }
}
