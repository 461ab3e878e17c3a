//! Configuration module for TRACER.
//!
//! - `core`: the network configuration and the per-architecture tap tables
//! - `enums`: the EfficientNet variants and their scaling coefficients

mod core;
mod enums;

pub use core::{ModelShape, TracerConfig};
pub use enums::{EfficientNetVariant, ScalingCoefficients};
