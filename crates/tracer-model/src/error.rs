use thiserror::Error;

/// The error type for TRACER model construction and weight loading.
///
/// Configuration problems are reported when the model is built, never from a
/// forward pass.
#[derive(Error, Debug)]
pub enum TracerError {
    /// An architecture name or index that has no known configuration.
    #[error("Unsupported architecture: {name}")]
    UnsupportedArchitecture {
        /// The rejected name or index.
        name: String,
    },

    /// Configuration parameters that are logically inconsistent.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// A scaling-parameter override whose key is not a known parameter.
    #[error("Unknown global parameter override: {key}")]
    UnknownOverride {
        /// The rejected key.
        key: String,
    },

    /// A block description string that cannot be decoded.
    #[error("Invalid block string '{block}': {reason}")]
    InvalidBlockString {
        /// The offending block string.
        block: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A feature tap that points past the end of the backbone.
    #[error("Tap {tap} uses block index {index}, but the backbone has only {block_count} blocks")]
    TapOutOfRange {
        /// Position of the tap in the tap table.
        tap: usize,
        /// The configured block index.
        index: usize,
        /// Number of blocks in the backbone.
        block_count: usize,
    },

    /// A feature tap whose block produces a different channel count than declared.
    #[error("Tap {tap} at block {index} produces {actual} channels, expected {expected}")]
    TapChannelMismatch {
        /// Position of the tap in the tap table.
        tap: usize,
        /// The configured block index.
        index: usize,
        /// The declared channel count.
        expected: usize,
        /// The channel count the block actually produces.
        actual: usize,
    },

    /// An input tensor with an invalid shape.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected tensor shape.
        expected: String,
        /// The actual tensor shape.
        actual: String,
    },

    /// A checkpoint tensor whose shape differs from the model parameter.
    #[error("Shape mismatch for '{key}': model expects {expected:?}, checkpoint has {actual:?}")]
    WeightShapeMismatch {
        /// The parameter name.
        key: String,
        /// Shape of the model parameter.
        expected: Vec<usize>,
        /// Shape stored in the checkpoint.
        actual: Vec<usize>,
    },

    /// A checkpoint that shares no parameter names with the model.
    #[error("Checkpoint has no parameter in common with the model ({checkpoint_keys} keys checked)")]
    NoMatchingWeights {
        /// Number of keys found in the checkpoint.
        checkpoint_keys: usize,
    },

    /// Error for when loading model weights fails.
    #[error("Failed to load weights: {reason}")]
    WeightLoadingFailed {
        /// The reason for the weight loading failure.
        reason: String,
    },
}

/// A specialized `Result` type for TRACER model operations.
pub type TracerResult<T> = Result<T, TracerError>;
