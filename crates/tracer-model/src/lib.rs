//! # TRACER-Burn
//!
//! A Rust implementation of TRACER (extreme attention guided salient object
//! tracing network) for salient object detection, built on the Burn deep
//! learning framework.
//!
//! ## Modules
//!
//! - `config`: the network configuration, EfficientNet variants and the
//!   per-architecture tap tables.
//! - `error`: the crate error type.
//! - `models`: the EfficientNet trunk, the decoder blocks and the full network.
//! - `weights`: loading PyTorch-named parameters into the network.
//!
//! ## Key Components
//!
//! - `Tracer`: the network.
//! - `TracerConfig`: validates the configuration and builds a `Tracer`.
//! - `WeightStore` and `LoadWeights`: partial, name-based checkpoint loading.

mod config;
mod error;
mod models;
mod weights;

#[doc(inline)]
pub use config::{EfficientNetVariant, ModelShape, ScalingCoefficients, TracerConfig};
#[doc(inline)]
pub use error::{TracerError, TracerResult};
#[doc(inline)]
pub use models::efficientnet::{
    round_filters, round_repeats, BackboneFeatures, BlockArgs, BlockSchedule, EfficientNet,
    Conv2dSame, Conv2dSameConfig, DynamicSamePadding, EfficientNetConfig, GlobalParams,
    MaxPool2dSame, MaxPool2dSameConfig, SamePad, SamePadding, StaticSamePadding, OVERRIDE_KEYS,
};
#[doc(inline)]
pub use models::tracer::{Tracer, TracerModelConfig, TracerOutput, TracerRecord};
#[doc(inline)]
pub use weights::{LoadReport, LoadWeights, WeightStore};
