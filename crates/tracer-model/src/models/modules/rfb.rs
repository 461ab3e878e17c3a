//! Receptive field block.

use burn::{prelude::*, tensor::activation::relu};

use super::conv::{BasicConv2d, BasicConv2dConfig};
use crate::{
    error::TracerResult,
    weights::{join, LoadWeights, WeightStore},
};

/// Configuration for [`ReceptiveFieldBlock`].
#[derive(Config, Debug)]
pub struct ReceptiveFieldBlockConfig {
    in_channels: usize,
    out_channels: usize,
}

impl ReceptiveFieldBlockConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ReceptiveFieldBlock<B> {
        let (inp, out) = (self.in_channels, self.out_channels);

        // 1x1 reduction, a 1xk / kx1 pair and a dilated 3x3 with dilation k.
        let branch = |k: usize| {
            let half = k / 2;
            vec![
                BasicConv2dConfig::square(inp, out, 1).init(device),
                BasicConv2dConfig::new(out, out, [1, k])
                    .with_padding([0, half])
                    .init(device),
                BasicConv2dConfig::new(out, out, [k, 1])
                    .with_padding([half, 0])
                    .init(device),
                BasicConv2dConfig::square(out, out, 3)
                    .with_padding([k, k])
                    .with_dilation(k)
                    .init(device),
            ]
        };

        ReceptiveFieldBlock {
            branch0: vec![BasicConv2dConfig::square(inp, out, 1).init(device)],
            branch1: branch(3),
            branch2: branch(5),
            branch3: branch(7),
            conv_cat: BasicConv2dConfig::square(4 * out, out, 3)
                .with_padding([1, 1])
                .init(device),
            conv_res: BasicConv2dConfig::square(inp, out, 1).init(device),
        }
    }
}

/// Four branches with growing receptive fields, fused and added to a 1x1
/// residual projection.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, out_channels, height, width]`
#[derive(Module, Debug)]
pub struct ReceptiveFieldBlock<B: Backend> {
    branch0: Vec<BasicConv2d<B>>,
    branch1: Vec<BasicConv2d<B>>,
    branch2: Vec<BasicConv2d<B>>,
    branch3: Vec<BasicConv2d<B>>,
    conv_cat: BasicConv2d<B>,
    conv_res: BasicConv2d<B>,
}

fn sequential<B: Backend>(layers: &[BasicConv2d<B>], x: Tensor<B, 4>) -> Tensor<B, 4> {
    layers.iter().fold(x, |x, layer| layer.forward(x))
}

fn load_sequential<B: Backend>(
    layers: Vec<BasicConv2d<B>>,
    store: &mut WeightStore,
    prefix: &str,
) -> TracerResult<Vec<BasicConv2d<B>>> {
    layers
        .into_iter()
        .enumerate()
        .map(|(i, layer)| layer.load_weights(store, &join(prefix, &i.to_string())))
        .collect()
}

impl<B: Backend> ReceptiveFieldBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branches = [&self.branch0, &self.branch1, &self.branch2, &self.branch3]
            .into_iter()
            .map(|branch| sequential(branch, x.clone()))
            .collect();
        let fused = self.conv_cat.forward(Tensor::cat(branches, 1));

        relu(fused + self.conv_res.forward(x))
    }
}

impl<B: Backend> LoadWeights for ReceptiveFieldBlock<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.branch0 = load_sequential(self.branch0, store, &join(prefix, "branch0"))?;
        self.branch1 = load_sequential(self.branch1, store, &join(prefix, "branch1"))?;
        self.branch2 = load_sequential(self.branch2, store, &join(prefix, "branch2"))?;
        self.branch3 = load_sequential(self.branch3, store, &join(prefix, "branch3"))?;
        self.conv_cat = self.conv_cat.load_weights(store, &join(prefix, "conv_cat"))?;
        self.conv_res = self.conv_res.load_weights(store, &join(prefix, "conv_res"))?;
        Ok(self)
    }
}
