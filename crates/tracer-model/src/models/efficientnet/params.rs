//! # EfficientNet scaling parameters
//!
//! Block descriptions, model-wide scaling coefficients and the rounding
//! rules that turn the base b0 layout into any other family member.

use burn::prelude::*;

use crate::{
    config::EfficientNetVariant,
    error::{TracerError, TracerResult},
};

/// The b0 stage layout every variant is scaled from.
pub const DEFAULT_BLOCKS: [&str; 7] = [
    "r1_k3_s11_e1_i32_o16_se0.25",
    "r2_k3_s22_e6_i16_o24_se0.25",
    "r2_k5_s22_e6_i24_o40_se0.25",
    "r3_k3_s22_e6_i40_o80_se0.25",
    "r3_k5_s11_e6_i80_o112_se0.25",
    "r4_k5_s22_e6_i112_o192_se0.25",
    "r1_k3_s11_e6_i192_o320_se0.25",
];

/// Keys accepted by [`GlobalParams::set`].
pub const OVERRIDE_KEYS: [&str; 11] = [
    "width_coefficient",
    "depth_coefficient",
    "image_size",
    "dropout_rate",
    "num_classes",
    "batch_norm_momentum",
    "batch_norm_epsilon",
    "drop_connect_rate",
    "depth_divisor",
    "min_depth",
    "include_top",
];

/// Model-wide parameters shared by the stem and every block.
#[derive(Config, Debug, PartialEq)]
pub struct GlobalParams {
    /// Channel multiplier; `None` leaves channel counts untouched.
    #[config(default = "None")]
    pub width_coefficient: Option<f64>,
    /// Repeat multiplier; `None` leaves repeat counts untouched.
    #[config(default = "None")]
    pub depth_coefficient: Option<f64>,
    /// Input resolution used to precompute static padding. `None` selects
    /// dynamic padding.
    #[config(default = "None")]
    pub image_size: Option<usize>,
    #[config(default = "0.2")]
    pub dropout_rate: f64,
    #[config(default = "1000")]
    pub num_classes: usize,
    /// TensorFlow-style momentum; the running-average weight is `1 - momentum`.
    #[config(default = "0.99")]
    pub batch_norm_momentum: f64,
    #[config(default = "1e-3")]
    pub batch_norm_epsilon: f64,
    /// Maximum stochastic depth rate, reached at the last block.
    #[config(default = "0.2")]
    pub drop_connect_rate: f64,
    /// Channel counts are rounded to multiples of this value.
    #[config(default = "8")]
    pub depth_divisor: usize,
    #[config(default = "None")]
    pub min_depth: Option<usize>,
    #[config(default = "true")]
    pub include_top: bool,
}

impl GlobalParams {
    /// Parameters of a named EfficientNet variant, with static padding
    /// computed for the variant's base resolution.
    pub fn for_variant(variant: &EfficientNetVariant) -> Self {
        let coefficients = variant.coefficients();
        Self::new()
            .with_width_coefficient(Some(coefficients.width))
            .with_depth_coefficient(Some(coefficients.depth))
            .with_image_size(Some(coefficients.resolution))
            .with_dropout_rate(coefficients.dropout)
    }

    /// Replaces one parameter by name.
    ///
    /// Optional parameters are cleared by a negative value. Unknown keys are
    /// rejected.
    pub fn set(&mut self, key: &str, value: f64) -> TracerResult<()> {
        if !OVERRIDE_KEYS.contains(&key) {
            return Err(TracerError::UnknownOverride {
                key: key.to_string(),
            });
        }
        let optional = |value: f64| (value >= 0.0).then_some(value);
        let count = |value: f64| -> TracerResult<usize> {
            if value < 0.0 || value.fract() != 0.0 {
                return Err(TracerError::InvalidConfiguration {
                    reason: format!("override '{key}' must be a non-negative integer, got {value}"),
                });
            }
            Ok(value as usize)
        };

        match key {
            "width_coefficient" => self.width_coefficient = optional(value),
            "depth_coefficient" => self.depth_coefficient = optional(value),
            "image_size" => {
                self.image_size = match optional(value) {
                    Some(size) => Some(count(size)?),
                    None => None,
                }
            }
            "dropout_rate" => self.dropout_rate = value,
            "num_classes" => self.num_classes = count(value)?,
            "batch_norm_momentum" => self.batch_norm_momentum = value,
            "batch_norm_epsilon" => self.batch_norm_epsilon = value,
            "drop_connect_rate" => self.drop_connect_rate = value,
            "depth_divisor" => self.depth_divisor = count(value)?,
            "min_depth" => {
                self.min_depth = match optional(value) {
                    Some(depth) => Some(count(depth)?),
                    None => None,
                }
            }
            "include_top" => self.include_top = value != 0.0,
            _ => {
                return Err(TracerError::UnknownOverride {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Applies every `(key, value)` override in order.
    pub fn with_overrides<'a, I>(mut self, overrides: I) -> TracerResult<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (key, value) in overrides {
            self.set(key, value)?;
        }
        Ok(self)
    }

    /// PyTorch batch-norm momentum, i.e. the weight of the new observation.
    pub fn torch_momentum(&self) -> f64 {
        1.0 - self.batch_norm_momentum
    }
}

/// Scales a channel count by the width coefficient and rounds it to a
/// multiple of the divisor, never losing more than 10% of the scaled value.
pub fn round_filters(filters: usize, params: &GlobalParams) -> usize {
    let Some(multiplier) = params.width_coefficient.filter(|m| *m != 0.0) else {
        return filters;
    };
    let divisor = params.depth_divisor;
    let min_depth = params.min_depth.filter(|d| *d != 0).unwrap_or(divisor);

    let filters = filters as f64 * multiplier;
    let rounded = (filters + divisor as f64 / 2.0) as usize / divisor * divisor;
    let mut new_filters = min_depth.max(rounded);
    if (new_filters as f64) < 0.9 * filters {
        new_filters += divisor;
    }
    new_filters
}

/// Scales a repeat count by the depth coefficient, always rounding up.
pub fn round_repeats(repeats: usize, params: &GlobalParams) -> usize {
    match params.depth_coefficient.filter(|m| *m != 0.0) {
        Some(multiplier) => (multiplier * repeats as f64).ceil() as usize,
        None => repeats,
    }
}

/// `ceil(size / stride)`, the spatial size after a SAME-padded stride.
pub const fn output_image_size(size: usize, stride: usize) -> usize {
    size.div_ceil(stride)
}

/// Description of one backbone stage.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockArgs {
    pub num_repeat: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub expand_ratio: usize,
    pub input_filters: usize,
    pub output_filters: usize,
    pub se_ratio: Option<f64>,
    pub id_skip: bool,
}

impl BlockArgs {
    /// Decodes a stage string such as `r1_k3_s11_e1_i32_o16_se0.25`.
    ///
    /// Every `_`-separated token is split at its first digit into a key and a
    /// value; tokens without a digit are ignored except for `noskip`, which
    /// disables the residual connection.
    pub fn decode(block: &str) -> TracerResult<Self> {
        let invalid = |reason: String| TracerError::InvalidBlockString {
            block: block.to_string(),
            reason,
        };

        let mut options: Vec<(&str, &str)> = Vec::new();
        for token in block.split('_') {
            if let Some(pos) = token.find(|c: char| c.is_ascii_digit()) {
                options.push(token.split_at(pos));
            }
        }
        let lookup = |key: &str| {
            options
                .iter()
                .rev()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
        };
        let integer = |key: &str| -> TracerResult<usize> {
            let value = lookup(key).ok_or_else(|| invalid(format!("missing '{key}'")))?;
            value
                .parse()
                .map_err(|_| invalid(format!("'{key}' is not an integer: {value}")))
        };

        let stride = lookup("s").ok_or_else(|| invalid("missing 's'".to_string()))?;
        let stride_bytes = stride.as_bytes();
        let uniform = match stride_bytes {
            [_] => true,
            [a, b] => a == b,
            _ => false,
        };
        if !uniform || !stride_bytes.iter().all(u8::is_ascii_digit) {
            return Err(invalid(format!(
                "stride must be one digit or two equal digits, got '{stride}'"
            )));
        }
        let stride = usize::from(stride_bytes[0] - b'0');

        let se_ratio = match lookup("se") {
            Some(value) => Some(
                value
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("'se' is not a number: {value}")))?,
            ),
            None => None,
        };

        Ok(Self {
            num_repeat: integer("r")?,
            kernel_size: integer("k")?,
            stride,
            expand_ratio: integer("e")?,
            input_filters: integer("i")?,
            output_filters: integer("o")?,
            se_ratio,
            id_skip: !block.contains("noskip"),
        })
    }

    /// Encodes the stage back into its string form.
    pub fn encode(&self) -> String {
        let mut parts = vec![
            format!("r{}", self.num_repeat),
            format!("k{}", self.kernel_size),
            format!("s{}{}", self.stride, self.stride),
            format!("e{}", self.expand_ratio),
            format!("i{}", self.input_filters),
            format!("o{}", self.output_filters),
        ];
        if let Some(se_ratio) = self.se_ratio.filter(|r| *r > 0.0 && *r <= 1.0) {
            parts.push(format!("se{se_ratio}"));
        }
        if !self.id_skip {
            parts.push("noskip".to_string());
        }
        parts.join("_")
    }

    /// Decodes a list of stage strings.
    pub fn decode_all<S: AsRef<str>>(blocks: &[S]) -> TracerResult<Vec<Self>> {
        blocks.iter().map(|b| Self::decode(b.as_ref())).collect()
    }

    /// The b0 stage layout.
    pub fn efficientnet_defaults() -> TracerResult<Vec<Self>> {
        Self::decode_all(&DEFAULT_BLOCKS)
    }

    /// Whether a squeeze-excite gate is built for this block.
    pub fn has_se(&self) -> bool {
        self.se_ratio.is_some_and(|r| r > 0.0 && r <= 1.0)
    }
}

/// One concrete block of the scaled backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    /// Arguments after width scaling, with `num_repeat` left as the stage total.
    pub args: BlockArgs,
    /// Input resolution for static padding, if known.
    pub image_size: Option<usize>,
}

/// The fully expanded, scaled block list of a backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSchedule {
    /// Output channels of the stem.
    pub stem_channels: usize,
    /// Static padding resolution of the stem.
    pub stem_image_size: Option<usize>,
    pub blocks: Vec<BlockSpec>,
}

impl BlockSchedule {
    /// Scales `stages` by `params` and expands the repeats.
    ///
    /// The first block of a stage carries the stage stride; the remaining
    /// repeats take the stage output as input and use stride 1.
    pub fn build(stages: &[BlockArgs], params: &GlobalParams) -> Self {
        let stem_image_size = params.image_size;
        let mut image_size = stem_image_size.map(|s| output_image_size(s, 2));
        let mut blocks = Vec::new();

        for stage in stages {
            let mut args = BlockArgs {
                input_filters: round_filters(stage.input_filters, params),
                output_filters: round_filters(stage.output_filters, params),
                num_repeat: round_repeats(stage.num_repeat, params),
                ..stage.clone()
            };

            blocks.push(BlockSpec {
                args: args.clone(),
                image_size,
            });
            image_size = image_size.map(|s| output_image_size(s, args.stride));

            if args.num_repeat > 1 {
                args.input_filters = args.output_filters;
                args.stride = 1;
            }
            for _ in 1..args.num_repeat {
                blocks.push(BlockSpec {
                    args: args.clone(),
                    image_size,
                });
            }
        }

        Self {
            stem_channels: round_filters(32, params),
            stem_image_size,
            blocks,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Output channels of block `index`.
    pub fn output_channels(&self, index: usize) -> Option<usize> {
        self.blocks.get(index).map(|b| b.args.output_filters)
    }
}
