//! Enumeration types for TRACER configuration.

use burn::prelude::*;

use crate::error::{TracerError, TracerResult};

/// Width, depth, resolution and dropout coefficients of one EfficientNet variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingCoefficients {
    /// Channel multiplier.
    pub width: f64,
    /// Repeat multiplier.
    pub depth: f64,
    /// Base input resolution the variant was trained at.
    pub resolution: usize,
    /// Dropout rate of the classification head.
    pub dropout: f64,
}

/// The EfficientNet family members the backbone can be built from.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum EfficientNetVariant {
    B0,
    B1,
    B2,
    B3,
    B4,
    B5,
    B6,
    B7,
    B8,
    /// Only constructible without pretrained weights.
    L2,
}

impl EfficientNetVariant {
    /// Every variant, in order.
    pub const ALL: [Self; 10] = [
        Self::B0,
        Self::B1,
        Self::B2,
        Self::B3,
        Self::B4,
        Self::B5,
        Self::B6,
        Self::B7,
        Self::B8,
        Self::L2,
    ];

    /// Parses a name such as `efficientnet-b3`.
    pub fn from_name(name: &str) -> TracerResult<Self> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.name() == name)
            .ok_or_else(|| TracerError::UnsupportedArchitecture {
                name: name.to_string(),
            })
    }

    /// The variant TRACER uses for architecture index `arch` (`0..=7`).
    pub fn from_tracer_arch(arch: usize) -> TracerResult<Self> {
        match arch {
            0..=7 => Ok(Self::ALL[arch].clone()),
            _ => Err(TracerError::UnsupportedArchitecture {
                name: format!("TRACER arch {arch}"),
            }),
        }
    }

    /// The canonical name, e.g. `efficientnet-b0`.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::B0 => "efficientnet-b0",
            Self::B1 => "efficientnet-b1",
            Self::B2 => "efficientnet-b2",
            Self::B3 => "efficientnet-b3",
            Self::B4 => "efficientnet-b4",
            Self::B5 => "efficientnet-b5",
            Self::B6 => "efficientnet-b6",
            Self::B7 => "efficientnet-b7",
            Self::B8 => "efficientnet-b8",
            Self::L2 => "efficientnet-l2",
        }
    }

    pub fn coefficients(&self) -> ScalingCoefficients {
        let (width, depth, resolution, dropout) = match self {
            Self::B0 => (1.0, 1.0, 224, 0.2),
            Self::B1 => (1.0, 1.1, 240, 0.2),
            Self::B2 => (1.1, 1.2, 260, 0.3),
            Self::B3 => (1.2, 1.4, 300, 0.3),
            Self::B4 => (1.4, 1.8, 380, 0.4),
            Self::B5 => (1.6, 2.2, 456, 0.4),
            Self::B6 => (1.8, 2.6, 528, 0.5),
            Self::B7 => (2.0, 3.1, 600, 0.5),
            Self::B8 => (2.2, 3.6, 672, 0.5),
            Self::L2 => (4.3, 5.3, 800, 0.5),
        };
        ScalingCoefficients {
            width,
            depth,
            resolution,
            dropout,
        }
    }
}
