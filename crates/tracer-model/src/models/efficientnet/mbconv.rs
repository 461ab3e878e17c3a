//! Mobile inverted bottleneck block.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig,
    },
    prelude::*,
    tensor::activation::{sigmoid, silu},
};
use tracer_extra_ops::TensorExtraOps;

use super::{
    padding::{Conv2dSame, Conv2dSameConfig},
    BlockSpec, GlobalParams,
};
use crate::{
    error::TracerResult,
    weights::{join, LoadWeights, WeightStore},
};

/// Configuration for [`MBConvBlock`].
#[derive(Config, Debug)]
pub struct MBConvBlockConfig {
    input_filters: usize,
    output_filters: usize,
    kernel_size: usize,
    #[config(default = "1")]
    stride: usize,
    #[config(default = "1")]
    expand_ratio: usize,
    #[config(default = "None")]
    se_ratio: Option<f64>,
    #[config(default = "true")]
    id_skip: bool,
    /// PyTorch-convention momentum.
    #[config(default = "0.01")]
    bn_momentum: f64,
    #[config(default = "1e-3")]
    bn_epsilon: f64,
    /// Input resolution for static padding.
    #[config(default = "None")]
    image_size: Option<usize>,
}

impl MBConvBlockConfig {
    /// Configuration of one scheduled backbone block.
    pub fn from_spec(spec: &BlockSpec, params: &GlobalParams) -> Self {
        let args = &spec.args;
        Self::new(args.input_filters, args.output_filters, args.kernel_size)
            .with_stride(args.stride)
            .with_expand_ratio(args.expand_ratio)
            .with_se_ratio(args.has_se().then_some(args.se_ratio).flatten())
            .with_id_skip(args.id_skip)
            .with_bn_momentum(params.torch_momentum())
            .with_bn_epsilon(params.batch_norm_epsilon)
            .with_image_size(spec.image_size)
    }

    pub fn init<B: Backend>(&self, device: &Device<B>) -> MBConvBlock<B> {
        let batch_norm = |channels: usize| {
            BatchNormConfig::new(channels)
                .with_momentum(self.bn_momentum)
                .with_epsilon(self.bn_epsilon)
                .init(device)
        };

        let inp = self.input_filters;
        let oup = inp * self.expand_ratio;

        let (expand_conv, bn0) = if self.expand_ratio != 1 {
            let conv = Conv2dSameConfig::new([inp, oup], 1)
                .with_image_size(self.image_size)
                .init(device);
            (Some(conv), Some(batch_norm(oup)))
        } else {
            (None, None)
        };

        let depthwise_conv = Conv2dSameConfig::new([oup, oup], self.kernel_size)
            .with_stride(self.stride)
            .with_groups(oup)
            .with_image_size(self.image_size)
            .init(device);
        let bn1 = batch_norm(oup);

        let (se_reduce, se_expand) = match self.se_ratio.filter(|r| *r > 0.0 && *r <= 1.0) {
            Some(ratio) => {
                let squeezed = ((inp as f64 * ratio) as usize).max(1);
                (
                    Some(Conv2dConfig::new([oup, squeezed], [1, 1]).init(device)),
                    Some(Conv2dConfig::new([squeezed, oup], [1, 1]).init(device)),
                )
            }
            None => (None, None),
        };

        let project_conv = Conv2dSameConfig::new([oup, self.output_filters], 1)
            .with_image_size(self.image_size.map(|s| s.div_ceil(self.stride)))
            .init(device);
        let bn2 = batch_norm(self.output_filters);

        MBConvBlock {
            expand_conv,
            bn0,
            depthwise_conv,
            bn1,
            se_reduce,
            se_expand,
            project_conv,
            bn2,
            skip: self.id_skip && self.stride == 1 && inp == self.output_filters,
        }
    }
}

/// Expansion, depthwise convolution, squeeze-excite and projection, with an
/// optional residual around the whole block.
#[derive(Module, Debug)]
pub struct MBConvBlock<B: Backend> {
    expand_conv: Option<Conv2dSame<B>>,
    bn0: Option<BatchNorm<B, 2>>,
    depthwise_conv: Conv2dSame<B>,
    bn1: BatchNorm<B, 2>,
    se_reduce: Option<Conv2d<B>>,
    se_expand: Option<Conv2d<B>>,
    project_conv: Conv2dSame<B>,
    bn2: BatchNorm<B, 2>,
    skip: bool,
}

impl<B: Backend> MBConvBlock<B> {
    /// Runs the block. Stochastic depth is applied to the residual branch
    /// only when `training` is set.
    pub fn forward(
        &self,
        inputs: Tensor<B, 4>,
        drop_connect_rate: Option<f64>,
        training: bool,
    ) -> Tensor<B, 4> {
        let mut x = inputs.clone();
        if let (Some(conv), Some(bn)) = (&self.expand_conv, &self.bn0) {
            x = silu(bn.forward(conv.forward(x)));
        }

        x = silu(self.bn1.forward(self.depthwise_conv.forward(x)));

        if let (Some(reduce), Some(expand)) = (&self.se_reduce, &self.se_expand) {
            let squeezed = x.clone().mean_dim(2).mean_dim(3);
            let squeezed = expand.forward(silu(reduce.forward(squeezed)));
            x = sigmoid(squeezed) * x;
        }

        x = self.bn2.forward(self.project_conv.forward(x));

        if self.skip {
            if let Some(rate) = drop_connect_rate.filter(|r| *r > 0.0) {
                x = x.drop_connect(rate, training);
            }
            x = x + inputs;
        }
        x
    }

    /// Whether the block adds its input to its output.
    pub const fn has_residual(&self) -> bool {
        self.skip
    }
}

impl<B: Backend> LoadWeights for MBConvBlock<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.expand_conv = self
            .expand_conv
            .map(|conv| conv.load_weights(store, &join(prefix, "_expand_conv")))
            .transpose()?;
        self.bn0 = self
            .bn0
            .map(|bn| bn.load_weights(store, &join(prefix, "_bn0")))
            .transpose()?;
        self.depthwise_conv = self
            .depthwise_conv
            .load_weights(store, &join(prefix, "_depthwise_conv"))?;
        self.bn1 = self.bn1.load_weights(store, &join(prefix, "_bn1"))?;
        self.se_reduce = self
            .se_reduce
            .map(|conv| conv.load_weights(store, &join(prefix, "_se_reduce")))
            .transpose()?;
        self.se_expand = self
            .se_expand
            .map(|conv| conv.load_weights(store, &join(prefix, "_se_expand")))
            .transpose()?;
        self.project_conv = self
            .project_conv
            .load_weights(store, &join(prefix, "_project_conv"))?;
        self.bn2 = self.bn2.load_weights(store, &join(prefix, "_bn2"))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn strided_block_halves_resolution_without_residual() {
        let device = Default::default();
        let block = MBConvBlockConfig::new(16, 24, 3)
            .with_stride(2)
            .with_expand_ratio(6)
            .with_se_ratio(Some(0.25))
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 16, 15, 15], Distribution::Default, &device);

        let output = block.forward(x, Some(0.1), false);

        assert!(!block.has_residual());
        assert_eq!(output.dims(), [2, 24, 8, 8]);
    }

    #[test]
    fn squeeze_width_follows_input_filters() {
        let device = Default::default();
        let block = MBConvBlockConfig::new(16, 24, 3)
            .with_expand_ratio(6)
            .with_se_ratio(Some(0.25))
            .init::<TestBackend>(&device);

        let reduce = block.se_reduce.as_ref().unwrap();
        assert_eq!(reduce.weight.dims(), [4, 96, 1, 1]);
        assert!(block.expand_conv.is_some());
    }

    #[test]
    fn unit_expansion_skips_expand_conv() {
        let device = Default::default();
        let block = MBConvBlockConfig::new(32, 16, 3).init::<TestBackend>(&device);

        assert!(block.expand_conv.is_none());
        assert!(block.bn0.is_none());
        assert!(block.se_reduce.is_none());
    }

    #[test]
    fn residual_block_is_deterministic_in_eval() {
        let device = Default::default();
        let block = MBConvBlockConfig::new(24, 24, 5)
            .with_expand_ratio(6)
            .with_se_ratio(Some(0.25))
            .with_image_size(Some(8))
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([1, 24, 8, 8], Distribution::Default, &device);

        let a = block.forward(x.clone(), Some(0.2), false);
        let b = block.forward(x, Some(0.2), false);

        assert!(block.has_residual());
        assert_eq!(a.dims(), [1, 24, 8, 8]);
        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }
}
