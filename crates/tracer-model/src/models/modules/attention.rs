//! # Union attention
//!
//! A channel tracer re-weights channels from their pooled statistics, the
//! least confident channels are masked out, and a spatial tracer collapses
//! the result to a single-channel map.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig,
    },
    prelude::*,
    tensor::activation::{sigmoid, softmax},
};
use tracer_extra_ops::quantile;

use crate::{
    error::TracerResult,
    weights::{join, LoadWeights, WeightStore},
};

/// Configuration for [`UnionAttention`].
#[derive(Config, Debug)]
pub struct UnionAttentionConfig {
    channels: usize,
    /// Quantile below which channel-mask values are zeroed.
    #[config(default = "0.1")]
    confidence_ratio: f64,
    /// Build only the channel tracer; the spatial projections are omitted.
    #[config(default = "false")]
    channel_only: bool,
}

impl UnionAttentionConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> UnionAttention<B> {
        let c = self.channels;
        let projection = |out: usize| {
            Conv2dConfig::new([c, out], [1, 1])
                .with_bias(false)
                .init(device)
        };
        let spatial = |enabled: bool| enabled.then(|| projection(1));

        UnionAttention {
            bn: BatchNormConfig::new(c).init(device),
            norm: BatchNormConfig::new(c).init(device),
            channel_q: projection(c),
            channel_k: projection(c),
            channel_v: projection(c),
            fc: projection(c),
            spatial_q: spatial(!self.channel_only),
            spatial_k: spatial(!self.channel_only),
            spatial_v: spatial(!self.channel_only),
            confidence_ratio: self.confidence_ratio,
        }
    }
}

/// Channel and spatial attention gate.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]`
///   - output: `[batch_size, 1, height, width]`
#[derive(Module, Debug)]
pub struct UnionAttention<B: Backend> {
    bn: BatchNorm<B, 2>,
    norm: BatchNorm<B, 2>,
    channel_q: Conv2d<B>,
    channel_k: Conv2d<B>,
    channel_v: Conv2d<B>,
    fc: Conv2d<B>,
    spatial_q: Option<Conv2d<B>>,
    spatial_k: Option<Conv2d<B>>,
    spatial_v: Option<Conv2d<B>>,
    confidence_ratio: f64,
}

impl<B: Backend> UnionAttention<B> {
    /// Re-weights the channels of `x`.
    ///
    /// Returns `x * att + x` and the `[batch, channels, 1, 1]` attention.
    pub fn channel_tracer(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let [batch, channels, _, _] = x.dims();
        let pooled = self.norm.forward(x.clone().mean_dim(2).mean_dim(3));

        let q = self.channel_q.forward(pooled.clone()).reshape([batch, channels, 1]);
        let k = self.channel_k.forward(pooled.clone()).reshape([batch, channels, 1]);
        let v = self.channel_v.forward(pooled).reshape([batch, channels, 1]);

        let alpha = softmax(q.matmul(k.swap_dims(1, 2)), 2);
        let att = alpha.matmul(v).reshape([batch, channels, 1, 1]);
        let att = sigmoid(self.fc.forward(att));

        (x.clone() * att.clone() + x, att)
    }

    /// Zeroes every channel whose mask value is at or below the
    /// `confidence_ratio` quantile of its sample.
    pub fn masking(&self, x: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, _, _] = mask.dims();
        let mask = mask.reshape([batch, channels]);
        let threshold = quantile(mask.clone(), self.confidence_ratio).expand([batch, channels]);
        let dropped = mask.clone().lower_equal(threshold);
        let mask = mask.mask_fill(dropped, 0.0);

        x * mask.reshape([batch, channels, 1, 1])
    }

    /// Runs the full gate. Without spatial projections the masked channel
    /// features are returned instead of a single-channel map.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (x, att) = self.channel_tracer(x);
        let x = self.bn.forward(x);
        let x = self.masking(x, att);

        let (Some(spatial_q), Some(spatial_k), Some(spatial_v)) =
            (&self.spatial_q, &self.spatial_k, &self.spatial_v)
        else {
            return x;
        };

        let [batch, _, height, width] = x.dims();
        let q = spatial_q.forward(x.clone()).reshape([batch, height, width]);
        let k = spatial_k.forward(x.clone()).reshape([batch, height, width]);
        let v = spatial_v.forward(x).reshape([batch, height, width]);

        // Rows attend to rows: [batch, height, height].
        let alpha = softmax(q.matmul(k.swap_dims(1, 2)), 2);

        alpha.matmul(v.clone()).unsqueeze_dim(1) + v.unsqueeze_dim(1)
    }
}

impl<B: Backend> LoadWeights for UnionAttention<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.bn = self.bn.load_weights(store, &join(prefix, "bn"))?;
        self.norm = self.norm.load_weights(store, &join(prefix, "norm.0"))?;
        self.channel_q = self.channel_q.load_weights(store, &join(prefix, "channel_q"))?;
        self.channel_k = self.channel_k.load_weights(store, &join(prefix, "channel_k"))?;
        self.channel_v = self.channel_v.load_weights(store, &join(prefix, "channel_v"))?;
        self.fc = self.fc.load_weights(store, &join(prefix, "fc"))?;
        self.spatial_q = self
            .spatial_q
            .map(|conv| conv.load_weights(store, &join(prefix, "spatial_q")))
            .transpose()?;
        self.spatial_k = self
            .spatial_k
            .map(|conv| conv.load_weights(store, &join(prefix, "spatial_k")))
            .transpose()?;
        self.spatial_v = self
            .spatial_v
            .map(|conv| conv.load_weights(store, &join(prefix, "spatial_v")))
            .transpose()?;
        Ok(self)
    }
}
