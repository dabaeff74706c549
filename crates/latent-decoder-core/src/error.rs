//! Error type shared by the decoder crates

use thiserror::Error;

/// Errors raised when a tensor, configuration or numeric input violates a
/// block contract.
///
/// None of these are transient: the decoder is pure computation, so every
/// error is surfaced to the caller immediately and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecoderError {
    /// A tensor dimension does not match what a block expects
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Group normalization over a channel count the group count does not divide
    #[error("{channels} channels cannot be split into {groups} normalization groups")]
    IndivisibleChannels { channels: usize, groups: usize },

    /// An unrecognized configuration literal
    #[error("Invalid {kind} `{value}`, expected one of {expected:?}")]
    InvalidEnum {
        kind: &'static str,
        value: String,
        expected: &'static [&'static str],
    },

    /// A numeric input outside the domain of the operation
    #[error("Numeric domain error: {0}")]
    NumericDomain(String),

    /// A precision the backend cannot store float tensors in
    #[error("{precision} tensors are not supported by the {backend} backend")]
    UnsupportedPrecision {
        precision: &'static str,
        backend: String,
    },

    /// A stage plan whose channel counts do not chain
    #[error("Invalid decoder configuration: {0}")]
    InvalidConfig(String),
}

impl DecoderError {
    /// Shape mismatch on a 4D tensor's channel dimension
    pub fn channels(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: vec![expected],
            actual: vec![actual],
        }
    }
}

/// Fails with [`DecoderError::ShapeMismatch`] unless `dims[1] == expected`.
pub fn ensure_channels(
    context: &str,
    dims: [usize; 4],
    expected: usize,
) -> Result<(), DecoderError> {
    if dims[1] != expected {
        return Err(DecoderError::channels(context, expected, dims[1]));
    }
    Ok(())
}
