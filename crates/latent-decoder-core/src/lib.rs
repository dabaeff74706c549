//! Core Building Blocks for the Latent Decoder
//!
//! This crate provides the shared components used by the VAE decoder and the
//! sampling utilities.
//!
//! # Modules
//!
//! - [`groupnorm`] - Group normalization and the fused GroupNorm + SiLU unit
//! - [`silu`] - SiLU/Swish activation
//! - [`attention`] - Self-attention over token sequences
//! - [`precision`] - Precision modes (fp32/fp16/bf16)
//! - [`error`] - [`DecoderError`], shared by all decoder crates
//!
//! # Example
//!
//! ```ignore
//! use latent_decoder_core::groupnorm::GroupNormSilu;
//!
//! let unit = GroupNormSilu::<Backend>::new(128, &device)?;
//! let y = unit.forward(x); // same shape as x
//! ```

pub mod attention;
pub mod error;
pub mod groupnorm;
pub mod precision;
pub mod silu;

pub use attention::SelfAttention;
pub use error::DecoderError;
pub use groupnorm::{GroupNorm, GroupNormSilu, NORM_EPS, NORM_GROUPS};
pub use precision::PrecisionMode;
