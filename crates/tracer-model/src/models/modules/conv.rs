//! Convolution primitives shared by the decoder modules.
//!
//! Every block here is a convolution followed by batch-norm and SELU. Field
//! names follow the PyTorch checkpoint layout so that weights can be loaded
//! by name.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};
use tracer_extra_ops::TensorExtraOps;

use crate::{
    error::TracerResult,
    weights::{join, LoadWeights, WeightStore},
};

/// Configuration for [`BasicConv2d`].
#[derive(Config, Debug)]
pub struct BasicConv2dConfig {
    in_channels: usize,
    out_channels: usize,
    /// `[height, width]`.
    kernel_size: [usize; 2],
    #[config(default = "[0, 0]")]
    padding: [usize; 2],
    #[config(default = "1")]
    dilation: usize,
}

impl BasicConv2dConfig {
    /// A square `kernel x kernel` convolution.
    pub fn square(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self::new(in_channels, out_channels, [kernel, kernel])
    }

    pub fn init<B: Backend>(&self, device: &Device<B>) -> BasicConv2d<B> {
        let conv = Conv2dConfig::new([self.in_channels, self.out_channels], self.kernel_size)
            .with_padding(PaddingConfig2d::Explicit(self.padding[0], self.padding[1]))
            .with_dilation([self.dilation, self.dilation])
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(self.out_channels).init(device);

        BasicConv2d { conv, bn }
    }
}

/// Convolution without bias, batch-norm and SELU.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, out_channels, height', width']`
#[derive(Module, Debug)]
pub struct BasicConv2d<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> BasicConv2d<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x)).selu()
    }
}

impl<B: Backend> LoadWeights for BasicConv2d<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.conv = self.conv.load_weights(store, &join(prefix, "conv"))?;
        self.bn = self.bn.load_weights(store, &join(prefix, "bn"))?;
        Ok(self)
    }
}

/// Configuration for [`DWConv`].
#[derive(Config, Debug)]
pub struct DWConvConfig {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    #[config(default = "0")]
    padding: usize,
    #[config(default = "1")]
    dilation: usize,
}

impl DWConvConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DWConv<B> {
        let dw_conv = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .with_groups(self.in_channels)
        .with_bias(false)
        .init(device);
        let bn = BatchNormConfig::new(self.out_channels).init(device);

        DWConv { dw_conv, bn }
    }
}

/// Grouped (depthwise) convolution, batch-norm and SELU.
#[derive(Module, Debug)]
pub struct DWConv<B: Backend> {
    dw_conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> DWConv<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.dw_conv.forward(x)).selu()
    }
}

impl<B: Backend> LoadWeights for DWConv<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.dw_conv = self.dw_conv.load_weights(store, &join(prefix, "DWConv"))?;
        self.bn = self.bn.load_weights(store, &join(prefix, "bn"))?;
        Ok(self)
    }
}

/// Configuration for [`DWSConv`].
#[derive(Config, Debug)]
pub struct DWSConvConfig {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    #[config(default = "0")]
    padding: usize,
    /// Depthwise filters per input channel.
    #[config(default = "1")]
    kernels_per_layer: usize,
}

impl DWSConvConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DWSConv<B> {
        let hidden = self.in_channels * self.kernels_per_layer;
        let dw_conv = Conv2dConfig::new(
            [self.in_channels, hidden],
            [self.kernel_size, self.kernel_size],
        )
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_groups(self.in_channels)
        .with_bias(false)
        .init(device);
        let bn = BatchNormConfig::new(hidden).init(device);
        let pw_conv = Conv2dConfig::new([hidden, self.out_channels], [1, 1])
            .with_bias(false)
            .init(device);
        let bn2 = BatchNormConfig::new(self.out_channels).init(device);

        DWSConv {
            dw_conv,
            bn,
            pw_conv,
            bn2,
        }
    }
}

/// Depthwise-separable convolution: depthwise conv, batch-norm, SELU, then
/// pointwise conv, batch-norm, SELU.
#[derive(Module, Debug)]
pub struct DWSConv<B: Backend> {
    dw_conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    pw_conv: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
}

impl<B: Backend> DWSConv<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.bn.forward(self.dw_conv.forward(x)).selu();
        self.bn2.forward(self.pw_conv.forward(x)).selu()
    }
}

impl<B: Backend> LoadWeights for DWSConv<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.dw_conv = self.dw_conv.load_weights(store, &join(prefix, "DWConv"))?;
        self.bn = self.bn.load_weights(store, &join(prefix, "bn"))?;
        self.pw_conv = self.pw_conv.load_weights(store, &join(prefix, "PWConv"))?;
        self.bn2 = self.bn2.load_weights(store, &join(prefix, "bn2"))?;
        Ok(self)
    }
}

/// `(kernel, padding, dilation)` of the four dilated branches.
const BRANCHES: [(usize, usize, usize); 4] = [(1, 0, 1), (3, 1, 1), (3, 3, 3), (3, 5, 5)];

/// One dilated branch: a depthwise conv followed by a 1x1 reduction.
#[derive(Module, Debug)]
pub struct DilatedBranch<B: Backend> {
    dw_conv: DWConv<B>,
    reduce: BasicConv2d<B>,
}

impl<B: Backend> DilatedBranch<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.reduce.forward(self.dw_conv.forward(x))
    }
}

impl<B: Backend> LoadWeights for DilatedBranch<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.dw_conv = self.dw_conv.load_weights(store, &join(prefix, "0"))?;
        self.reduce = self.reduce.load_weights(store, &join(prefix, "1"))?;
        Ok(self)
    }
}

/// Configuration for [`DilatedHead`].
#[derive(Config, Debug)]
pub struct DilatedHeadConfig {
    in_channels: usize,
    /// Width of the depthwise-separable stem and of the concatenated branches.
    hidden_channels: usize,
    #[config(default = "3")]
    kernel_size: usize,
}

impl DilatedHeadConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DilatedHead<B> {
        let hidden = self.hidden_channels;
        let dws_conv = DWSConvConfig::new(self.in_channels, hidden, self.kernel_size)
            .with_padding(1)
            .init(device);
        let branches = BRANCHES
            .iter()
            .map(|&(kernel, padding, dilation)| DilatedBranch {
                dw_conv: DWConvConfig::new(hidden, hidden, kernel)
                    .with_padding(padding)
                    .with_dilation(dilation)
                    .init(device),
                reduce: BasicConv2dConfig::square(hidden, hidden / 4, 1).init(device),
            })
            .collect();
        let conv = BasicConv2dConfig::square(hidden, 1, 1).init(device);

        DilatedHead {
            dws_conv,
            branches,
            conv,
        }
    }
}

/// Depthwise-separable stem, four dilated branches concatenated over a skip
/// connection, and a 1x1 projection to a single ReLU map.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, 1, height, width]`
#[derive(Module, Debug)]
pub struct DilatedHead<B: Backend> {
    dws_conv: DWSConv<B>,
    branches: Vec<DilatedBranch<B>>,
    conv: BasicConv2d<B>,
}

impl<B: Backend> DilatedHead<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.dws_conv.forward(x);
        let branches = self
            .branches
            .iter()
            .map(|branch| branch.forward(x.clone()))
            .collect();
        let x = Tensor::cat(branches, 1) + x;
        relu(self.conv.forward(x))
    }

    /// Loads the stem and branches from `{prefix}.DWSConv` and
    /// `{prefix}.DWConv1..4`, and the projection from `{prefix}.{output}`.
    pub fn load_weights_with_output(
        mut self,
        store: &mut WeightStore,
        prefix: &str,
        output: &str,
    ) -> TracerResult<Self> {
        self.dws_conv = self.dws_conv.load_weights(store, &join(prefix, "DWSConv"))?;
        self.branches = self
            .branches
            .into_iter()
            .enumerate()
            .map(|(i, branch)| branch.load_weights(store, &join(prefix, &format!("DWConv{}", i + 1))))
            .collect::<TracerResult<_>>()?;
        self.conv = self.conv.load_weights(store, &join(prefix, output))?;
        Ok(self)
    }
}
