//! Core configuration structures for TRACER.
//!
//! `TracerConfig` is the single value threaded through model construction.
//! Every module receives only the scalars it needs from it.

use burn::prelude::*;
use tracing::info;

use super::enums::EfficientNetVariant;
use crate::{
    error::{TracerError, TracerResult},
    models::{
        efficientnet::{validate_taps, BlockArgs, BlockSchedule, EfficientNetConfig, GlobalParams},
        tracer::{Tracer, TracerModelConfig},
    },
};

/// Main configuration for the TRACER network.
#[derive(Config, Debug)]
pub struct TracerConfig {
    /// Architecture index in `0..=7`; selects `efficientnet-b{arch}` and the
    /// matching tap table and input resolution.
    #[config(default = "7")]
    pub arch: usize,
    /// Output channels of the three receptive-field blocks, finest first.
    #[config(default = "[32, 64, 128]")]
    pub rfb_channels: [usize; 3],
    /// Radius of the low-frequency disc removed by the frequency edge module.
    #[config(default = "16.0")]
    pub frequency_radius: f64,
    /// Background-gate values above this threshold are treated as noise by
    /// object attention.
    #[config(default = "0.93")]
    pub denoise: f64,
    /// Fraction of least-confident channels suppressed by union attention.
    #[config(default = "0.1")]
    pub gamma: f64,
    /// Overrides of the backbone's global parameters, applied in order.
    #[config(default = "Vec::new()")]
    pub overrides: Vec<(String, f64)>,
}

/// Feature taps and resolution of one TRACER architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelShape {
    /// Backbone block indices after which features are captured.
    pub block_idx: [usize; 4],
    /// Channel counts of the captured features.
    pub channels: [usize; 4],
    /// Square input resolution the architecture is evaluated at.
    pub input_size: usize,
}

impl ModelShape {
    /// Tap table for architecture index `arch`.
    pub fn for_arch(arch: usize) -> TracerResult<Self> {
        let (block_idx, channels, input_size) = match arch {
            0 => ([2, 4, 10, 15], [24, 40, 112, 320], 320),
            1 => ([4, 7, 15, 22], [24, 40, 112, 320], 320),
            2 => ([4, 7, 15, 22], [24, 48, 120, 352], 352),
            3 => ([4, 7, 17, 25], [32, 48, 136, 384], 384),
            4 => ([5, 9, 21, 31], [32, 56, 160, 448], 448),
            5 => ([7, 12, 26, 38], [40, 64, 176, 512], 512),
            6 => ([8, 14, 30, 44], [40, 72, 200, 576], 576),
            7 => ([10, 17, 37, 54], [48, 80, 224, 640], 640),
            _ => {
                return Err(TracerError::UnsupportedArchitecture {
                    name: format!("TRACER arch {arch}"),
                })
            }
        };
        Ok(Self {
            block_idx,
            channels,
            input_size,
        })
    }

    /// Checks the taps against a concrete backbone schedule.
    pub fn validate_against(&self, schedule: &BlockSchedule) -> TracerResult<()> {
        validate_taps(&self.block_idx, &self.channels, schedule)
    }
}

impl TracerConfig {
    /// Validate the configuration and return appropriate errors for invalid settings.
    ///
    /// This checks scalar ranges and the override keys. Tap validation needs
    /// the backbone schedule and happens in [`TracerConfig::init`].
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedArchitecture`, `UnknownOverride` or
    /// `InvalidConfiguration`.
    pub fn validate(&self) -> TracerResult<()> {
        // 1. Architecture index must have a tap table
        ModelShape::for_arch(self.arch)?;

        // 2. Frequency radius must be positive and finite
        if !(self.frequency_radius.is_finite() && self.frequency_radius > 0.0) {
            return Err(TracerError::InvalidConfiguration {
                reason: format!(
                    "Frequency radius must be positive, got {}",
                    self.frequency_radius
                ),
            });
        }

        // 3. Denoise threshold is compared against a sigmoid complement
        if !(0.0..=1.0).contains(&self.denoise) {
            return Err(TracerError::InvalidConfiguration {
                reason: format!("Denoise must be in [0, 1], got {}", self.denoise),
            });
        }

        // 4. Gamma is a quantile
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(TracerError::InvalidConfiguration {
                reason: format!("Gamma must be in [0, 1], got {}", self.gamma),
            });
        }

        // 5. Receptive-field widths must be non-zero
        if self.rfb_channels.contains(&0) {
            return Err(TracerError::InvalidConfiguration {
                reason: format!(
                    "RFB channels must be non-zero, got {:?}",
                    self.rfb_channels
                ),
            });
        }

        // 6. Overrides must name known parameters
        let params = self.global_params()?;

        // 7. Drop connect keeps a fraction of each sample's residual branch
        if !(0.0..1.0).contains(&params.drop_connect_rate) {
            return Err(TracerError::InvalidConfiguration {
                reason: format!(
                    "Drop connect rate must be in [0, 1), got {}",
                    params.drop_connect_rate
                ),
            });
        }

        Ok(())
    }

    /// The backbone variant selected by `arch`.
    pub fn variant(&self) -> TracerResult<EfficientNetVariant> {
        EfficientNetVariant::from_tracer_arch(self.arch)
    }

    /// Tap table of the selected architecture.
    pub fn model_shape(&self) -> TracerResult<ModelShape> {
        ModelShape::for_arch(self.arch)
    }

    /// Global parameters of the selected variant with the overrides applied.
    pub fn global_params(&self) -> TracerResult<GlobalParams> {
        GlobalParams::for_variant(&self.variant()?).with_overrides(
            self.overrides
                .iter()
                .map(|(key, value)| (key.as_str(), *value)),
        )
    }

    /// Validates the configuration and builds the network.
    ///
    /// # Errors
    ///
    /// Any configuration error, including tap validation against the scaled
    /// backbone, is reported here; the forward pass never fails on
    /// configuration.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> TracerResult<Tracer<B>> {
        self.validate()?;
        let params = self.global_params()?;
        let shape = self.model_shape()?;
        let schedule = BlockSchedule::build(&BlockArgs::efficientnet_defaults()?, &params);
        shape.validate_against(&schedule)?;

        info!(
            variant = self.variant()?.name(),
            blocks = schedule.len(),
            taps = ?shape.block_idx,
            channels = ?shape.channels,
            "building TRACER"
        );

        let backbone = EfficientNetConfig::new(params, shape.block_idx, shape.channels)
            .with_frequency_radius(self.frequency_radius)
            .with_confidence_ratio(self.gamma)
            .init(device)?;

        Ok(TracerModelConfig::new(shape.channels)
            .with_rfb_channels(self.rfb_channels)
            .with_denoise(self.denoise)
            .with_gamma(self.gamma)
            .init(backbone, device))
    }
}
