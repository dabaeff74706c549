//! latent-decoder: Latent Diffusion Decoding in Pure Rust
//!
//! Maps Stable-Diffusion-style latents `[N, 4, h, w]` to images
//! `[N, 3, 8h, 8w]` using the Burn deep learning framework, together with the
//! numeric helpers the surrounding diffusion pipeline relies on.
//!
//! # Crates
//!
//! - [`core`] - group normalization, self-attention, precision, errors
//! - [`vae`] - decoder blocks, stage plan and [`Decoder`]
//! - [`samplers`] - noise schedule, sigmas, timestep embedding
//! - [`convert`] - named parameter loading and export
//!
//! # Backend Selection
//!
//! Choose a backend via feature flags:
//! - `ndarray`: CPU backend (no GPU required, default)
//! - `wgpu`: WebGPU backend (cross-platform GPU)
//!
//! # Example
//!
//! ```ignore
//! use latent_decoder::backends::{DefaultBackend, default_device};
//! use latent_decoder::{Decoder, DecoderConfig, image::to_rgb8};
//!
//! let device = default_device();
//! let decoder = Decoder::<DefaultBackend>::new(&DecoderConfig::sd1x(), &device)?;
//! let images = to_rgb8(decoder.forward(latents)?)?;
//! images[0].save("out.png")?;
//! ```

pub use latent_decoder_convert as convert;
pub use latent_decoder_core as core;
pub use latent_decoder_samplers as samplers;
pub use latent_decoder_vae as vae;

pub use latent_decoder_convert::{LoadError, ParamStore, ParamTensor, export_decoder, load_decoder};
pub use latent_decoder_core::{DecoderError, PrecisionMode};
pub use latent_decoder_samplers::{
    NoiseSchedule, ScheduleConfig, alphas_cumprod, timestep_embedding, timestep_embedding_batch,
};
pub use latent_decoder_vae::{Decoder, DecoderConfig, StageSpec, scaling};

pub mod backends;
pub mod image;

pub use image::{ChannelLayout, move_channel, rescale, to_rgb8};
