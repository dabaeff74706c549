//! Sampling utilities for latent diffusion
//!
//! The decoder consumes the final latents a sampler produces; this crate
//! holds the pieces samplers share with the rest of the pipeline:
//!
//! - [`schedule`] - scaled linear noise schedule, sigmas, inference timesteps
//! - [`timestep`] - sinusoidal timestep embedding

pub mod schedule;
pub mod timestep;

pub use schedule::{
    DEFAULT_BETA_END, DEFAULT_BETA_START, DEFAULT_TRAIN_STEPS, NoiseSchedule, ScheduleConfig,
    alphas_cumprod, betas, compute_sigmas, inference_timesteps, init_noise_latent,
    sigmas_from_alphas_cumprod,
};
pub use timestep::{
    TIMESTEP_EMBED_DIM, TIMESTEP_FREQS, timestep_embedding, timestep_embedding_batch,
    timestep_freqs,
};
