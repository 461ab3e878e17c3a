//! # TensorFlow-style SAME padding
//!
//! PyTorch convolutions pad symmetrically, so a strided layer sees a
//! different window than the TensorFlow graph the weights were trained in.
//! The layers here pad so that the output size is `ceil(input / stride)`,
//! putting the odd pixel after the input.

use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
};

use crate::{
    error::TracerResult,
    weights::{LoadWeights, WeightStore},
};

/// Total SAME pad along one axis.
fn total_pad(input: usize, kernel: usize, stride: usize, dilation: usize) -> usize {
    let output = input.div_ceil(stride);
    let needed = (output.saturating_sub(1)) * stride + (kernel - 1) * dilation + 1;
    needed.saturating_sub(input)
}

/// `(left, right, top, bottom)` pads for an `[height, width]` input.
fn split_pads(
    [height, width]: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
) -> (usize, usize, usize, usize) {
    let pad_h = total_pad(height, kernel[0], stride[0], dilation[0]);
    let pad_w = total_pad(width, kernel[1], stride[1], dilation[1]);
    (pad_w / 2, pad_w - pad_w / 2, pad_h / 2, pad_h - pad_h / 2)
}

/// A strategy for padding the input of a SAME layer.
pub trait SamePadding {
    /// Spatial output size of the layer for an `[height, width]` input.
    fn output_size(&self, input: [usize; 2]) -> [usize; 2];

    /// Pads `x` with zeros so that a VALID layer produces `output_size`.
    fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Computes the pad from the shape of every tensor it sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicSamePadding {
    kernel: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
}

impl DynamicSamePadding {
    pub const fn new(kernel: [usize; 2], stride: [usize; 2], dilation: [usize; 2]) -> Self {
        Self {
            kernel,
            stride,
            dilation,
        }
    }
}

impl SamePadding for DynamicSamePadding {
    fn output_size(&self, [height, width]: [usize; 2]) -> [usize; 2] {
        [height.div_ceil(self.stride[0]), width.div_ceil(self.stride[1])]
    }

    fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let pads = split_pads([height, width], self.kernel, self.stride, self.dilation);
        if pads == (0, 0, 0, 0) {
            return x;
        }
        x.pad(pads, 0.0)
    }
}

/// Pads every input by the amount computed once for a fixed image size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSamePadding {
    /// Effective kernel extent `(k - 1) * d + 1` per axis.
    extent: [usize; 2],
    stride: [usize; 2],
    pads: (usize, usize, usize, usize),
}

impl StaticSamePadding {
    pub fn new(
        kernel: [usize; 2],
        stride: [usize; 2],
        dilation: [usize; 2],
        image_size: [usize; 2],
    ) -> Self {
        Self {
            extent: [
                (kernel[0] - 1) * dilation[0] + 1,
                (kernel[1] - 1) * dilation[1] + 1,
            ],
            stride,
            pads: split_pads(image_size, kernel, stride, dilation),
        }
    }

    /// `(left, right, top, bottom)`.
    pub const fn pads(&self) -> (usize, usize, usize, usize) {
        self.pads
    }
}

impl SamePadding for StaticSamePadding {
    fn output_size(&self, [height, width]: [usize; 2]) -> [usize; 2] {
        let (left, right, top, bottom) = self.pads;
        // The pad is fixed, so the VALID layer decides the size.
        let valid = |size: usize, extent: usize, stride: usize| {
            size.saturating_sub(extent) / stride + 1
        };
        [
            valid(height + top + bottom, self.extent[0], self.stride[0]),
            valid(width + left + right, self.extent[1], self.stride[1]),
        ]
    }

    fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.pads == (0, 0, 0, 0) {
            return x;
        }
        x.pad(self.pads, 0.0)
    }
}

/// The padding variant chosen for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamePad {
    Dynamic(DynamicSamePadding),
    Static(StaticSamePadding),
}

impl SamePad {
    /// Static padding when `image_size` is known, dynamic otherwise.
    pub fn new(kernel: usize, stride: usize, dilation: usize, image_size: Option<usize>) -> Self {
        let kernel = [kernel, kernel];
        let stride = [stride, stride];
        let dilation = [dilation, dilation];
        match image_size {
            Some(size) => Self::Static(StaticSamePadding::new(
                kernel,
                stride,
                dilation,
                [size, size],
            )),
            None => Self::Dynamic(DynamicSamePadding::new(kernel, stride, dilation)),
        }
    }
}

impl SamePadding for SamePad {
    fn output_size(&self, input: [usize; 2]) -> [usize; 2] {
        match self {
            Self::Dynamic(padding) => padding.output_size(input),
            Self::Static(padding) => padding.output_size(input),
        }
    }

    fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Dynamic(padding) => padding.apply(x),
            Self::Static(padding) => padding.apply(x),
        }
    }
}

/// Configuration for [`Conv2dSame`].
#[derive(Config, Debug)]
pub struct Conv2dSameConfig {
    channels: [usize; 2],
    kernel_size: usize,
    #[config(default = "1")]
    stride: usize,
    #[config(default = "1")]
    dilation: usize,
    #[config(default = "1")]
    groups: usize,
    #[config(default = "false")]
    bias: bool,
    /// Fixed input resolution; `None` selects dynamic padding.
    #[config(default = "None")]
    image_size: Option<usize>,
}

impl Conv2dSameConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Conv2dSame<B> {
        let conv = Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
            .with_stride([self.stride, self.stride])
            .with_dilation([self.dilation, self.dilation])
            .with_groups(self.groups)
            .with_bias(self.bias)
            .init(device);
        let padding = SamePad::new(
            self.kernel_size,
            self.stride,
            self.dilation,
            self.image_size,
        );

        Conv2dSame {
            padding: Ignored(padding),
            conv,
        }
    }
}

/// A 2-D convolution with SAME padding.
#[derive(Module, Debug)]
pub struct Conv2dSame<B: Backend> {
    padding: Ignored<SamePad>,
    pub conv: Conv2d<B>,
}

impl<B: Backend> Conv2dSame<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(self.padding.0.apply(x))
    }

    pub fn padding(&self) -> &SamePad {
        &self.padding.0
    }
}

impl<B: Backend> LoadWeights for Conv2dSame<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.conv = self.conv.load_weights(store, prefix)?;
        Ok(self)
    }
}

/// Configuration for [`MaxPool2dSame`].
#[derive(Config, Debug)]
pub struct MaxPool2dSameConfig {
    kernel_size: usize,
    #[config(default = "None")]
    stride: Option<usize>,
    #[config(default = "1")]
    dilation: usize,
    #[config(default = "None")]
    image_size: Option<usize>,
}

impl MaxPool2dSameConfig {
    pub fn init(&self) -> MaxPool2dSame {
        let stride = self.stride.unwrap_or(self.kernel_size);
        let pool = MaxPool2dConfig::new([self.kernel_size, self.kernel_size])
            .with_strides([stride, stride])
            .with_dilation([self.dilation, self.dilation])
            .init();
        let padding = SamePad::new(self.kernel_size, stride, self.dilation, self.image_size);

        MaxPool2dSame {
            padding: Ignored(padding),
            pool,
        }
    }
}

/// Max pooling with SAME padding. The border is padded with zeros.
#[derive(Module, Clone, Debug)]
pub struct MaxPool2dSame {
    padding: Ignored<SamePad>,
    pool: MaxPool2d,
}

impl MaxPool2dSame {
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(self.padding.0.apply(x))
    }
}
