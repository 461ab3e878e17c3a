//! Multi-level aggregation of the three receptive-field outputs.

use burn::prelude::*;
use tracer_extra_ops::upsample_bilinear;

use super::{
    attention::{UnionAttention, UnionAttentionConfig},
    conv::{BasicConv2d, BasicConv2dConfig},
};
use crate::{
    error::TracerResult,
    weights::{join, LoadWeights, WeightStore},
};

/// Configuration for [`Aggregation`].
#[derive(Config, Debug)]
pub struct AggregationConfig {
    /// Channels of the finest, middle and coarsest inputs.
    #[config(default = "[32, 64, 128]")]
    channels: [usize; 3],
    #[config(default = "0.1")]
    confidence_ratio: f64,
}

impl AggregationConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Aggregation<B> {
        let [c0, c1, c2] = self.channels;
        let conv = |inp: usize, out: usize| {
            BasicConv2dConfig::square(inp, out, 3)
                .with_padding([1, 1])
                .init(device)
        };

        Aggregation {
            conv_upsample1: conv(c2, c1),
            conv_upsample2: conv(c2, c0),
            conv_upsample3: conv(c1, c0),
            conv_upsample4: conv(c2, c2),
            conv_upsample5: conv(c2 + c1, c2 + c1),
            conv_concat2: conv(c2 + c1, c2 + c1),
            conv_concat3: conv(c0 + c1 + c2, c0 + c1 + c2),
            attention: UnionAttentionConfig::new(c0 + c1 + c2)
                .with_confidence_ratio(self.confidence_ratio)
                .init(device),
        }
    }
}

/// Fuses the coarse-to-fine features into a single-channel decoder map.
///
/// # Shapes
///   - e4: `[batch_size, c2, h, w]`
///   - e3: `[batch_size, c1, 2h, 2w]`
///   - e2: `[batch_size, c0, 4h, 4w]`
///   - output: `[batch_size, 1, 4h, 4w]`
#[derive(Module, Debug)]
pub struct Aggregation<B: Backend> {
    conv_upsample1: BasicConv2d<B>,
    conv_upsample2: BasicConv2d<B>,
    conv_upsample3: BasicConv2d<B>,
    conv_upsample4: BasicConv2d<B>,
    conv_upsample5: BasicConv2d<B>,
    conv_concat2: BasicConv2d<B>,
    conv_concat3: BasicConv2d<B>,
    attention: UnionAttention<B>,
}

fn up<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    upsample_bilinear(x, 2, true)
}

impl<B: Backend> Aggregation<B> {
    pub fn forward(&self, e4: Tensor<B, 4>, e3: Tensor<B, 4>, e2: Tensor<B, 4>) -> Tensor<B, 4> {
        let e4_up = up(e4);
        let e3_up = up(e3.clone());

        let e3_1 = self.conv_upsample1.forward(e4_up.clone()) * e3;
        let e2_1 = self.conv_upsample2.forward(up(e4_up.clone()))
            * self.conv_upsample3.forward(e3_up)
            * e2;

        let e3_2 = Tensor::cat(vec![e3_1, self.conv_upsample4.forward(e4_up)], 1);
        let e3_2 = self.conv_concat2.forward(e3_2);

        let e2_2 = Tensor::cat(vec![e2_1, self.conv_upsample5.forward(up(e3_2))], 1);
        let x = self.conv_concat3.forward(e2_2);

        self.attention.forward(x)
    }
}

impl<B: Backend> LoadWeights for Aggregation<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        let key = |name: &str| join(prefix, name);
        self.conv_upsample1 = self.conv_upsample1.load_weights(store, &key("conv_upsample1"))?;
        self.conv_upsample2 = self.conv_upsample2.load_weights(store, &key("conv_upsample2"))?;
        self.conv_upsample3 = self.conv_upsample3.load_weights(store, &key("conv_upsample3"))?;
        self.conv_upsample4 = self.conv_upsample4.load_weights(store, &key("conv_upsample4"))?;
        self.conv_upsample5 = self.conv_upsample5.load_weights(store, &key("conv_upsample5"))?;
        self.conv_concat2 = self.conv_concat2.load_weights(store, &key("conv_concat2"))?;
        self.conv_concat3 = self.conv_concat3.load_weights(store, &key("conv_concat3"))?;
        self.attention = self.attention.load_weights(store, &key("UAM"))?;
        Ok(self)
    }
}
