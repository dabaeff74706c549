//! Sinusoidal timestep embedding
//!
//! Maps a scalar diffusion timestep to the 320-wide vector the denoising
//! network is conditioned on: 160 cosine components followed by 160 sine
//! components.

use burn::prelude::*;

use latent_decoder_core::error::DecoderError;
use latent_decoder_core::precision::PrecisionMode;

/// Number of frequencies; the embedding is twice as wide
pub const TIMESTEP_FREQS: usize = 160;
/// Width of the timestep embedding
pub const TIMESTEP_EMBED_DIM: usize = 2 * TIMESTEP_FREQS;

const MAX_PERIOD: f64 = 10000.0;

/// `freqs[i] = 10000^(-i / 160)` for `i` in `0..160`
pub fn timestep_freqs<B: Backend>(device: &B::Device) -> Tensor<B, 1> {
    let exponent = Tensor::<B, 1, Int>::arange(0..TIMESTEP_FREQS as i64, device)
        .float()
        .mul_scalar(-MAX_PERIOD.ln() / TIMESTEP_FREQS as f64);
    exponent.exp()
}

/// Embedding of a single timestep: `[cos(t * freqs), sin(t * freqs)]`
///
/// Computed in f32 and cast to `precision` at the end. Fails with
/// [`DecoderError::UnsupportedPrecision`] when the backend cannot hold
/// `precision`.
pub fn timestep_embedding<B: Backend>(
    timestep: f64,
    precision: PrecisionMode,
    device: &B::Device,
) -> Result<Tensor<B, 1>, DecoderError> {
    if !precision.is_supported::<B>(device) {
        return Err(DecoderError::UnsupportedPrecision {
            precision: precision.name(),
            backend: B::name(device),
        });
    }

    let args = timestep_freqs::<B>(device).mul_scalar(timestep);
    let embedding = Tensor::cat(vec![args.clone().cos(), args.sin()], 0);
    precision.cast(embedding)
}

/// Embeddings for a batch of timesteps
///
/// `[batch] -> [batch, 320]`, cosines first on every row.
pub fn timestep_embedding_batch<B: Backend>(timesteps: Tensor<B, 1>) -> Tensor<B, 2> {
    let device = timesteps.device();
    let [batch] = timesteps.dims();

    let freqs = timestep_freqs::<B>(&device).reshape([1, TIMESTEP_FREQS]);
    // [batch, 1] * [1, 160] -> [batch, 160]
    let args = timesteps.reshape([batch, 1]).mul(freqs);

    Tensor::cat(vec![args.clone().cos(), args.sin()], 1)
}
