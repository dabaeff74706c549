//! Variational Autoencoder (VAE) Decoder for Latent Diffusion
//!
//! This crate provides the decoder used in Stable Diffusion to convert latent
//! representations back into pixel space.
//!
//! # Components
//!
//! - [`Decoder`] - Ordered stage pipeline reconstructing images from latents
//! - [`ResidualBlock`], [`AttentionBlock`], [`UpsamplingStage`] - the blocks
//!   the pipeline is built from
//!
//! # Scaling Factors
//!
//! Different models use different latent scaling:
//! - SD 1.x: `0.18215`
//! - SDXL: `0.13025`
//!
//! [`Decoder::forward`] divides the latent by the configured factor before the
//! first stage; [`Decoder::forward_raw`] skips that step.
//!
//! # Example
//!
//! ```ignore
//! use latent_decoder_vae::{Decoder, DecoderConfig};
//!
//! let config = DecoderConfig::sd1x();
//! let decoder = Decoder::<Backend>::new(&config, &device)?;
//!
//! // [1, 4, 64, 64] latent -> [1, 3, 512, 512] image
//! let image = decoder.forward(latents)?;
//! ```

pub mod blocks;
pub mod decoder;

pub use blocks::{AttentionBlock, ResidualBlock, UpsamplingStage, upsample_nearest};
pub use decoder::{Decoder, DecoderConfig, Stage, StageSpec, scaling, validate_plan};
