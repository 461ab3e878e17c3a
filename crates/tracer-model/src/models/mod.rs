//! # Model Architectures
//!
//! - `efficientnet`: the scaled EfficientNet trunk with SAME padding and the
//!   frequency edge module at its first tap.
//! - `modules`: attention, receptive-field, aggregation and convolution blocks.
//! - `tracer`: the full network.

pub mod efficientnet;
pub mod modules;
pub mod tracer;
