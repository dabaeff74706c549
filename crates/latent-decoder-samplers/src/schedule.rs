//! Noise schedules for diffusion models
//!
//! This module provides the noise schedule utilities samplers share: the
//! cumulative alpha table, sigma conversion and inference timestep spacing.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use latent_decoder_core::error::DecoderError;

/// SD 1.x `beta_start` (the schedule interpolates between square roots)
pub const DEFAULT_BETA_START: f64 = 0.00085;
/// SD 1.x `beta_end`
pub const DEFAULT_BETA_END: f64 = 0.0120;
/// Number of diffusion timesteps the model was trained with
pub const DEFAULT_TRAIN_STEPS: usize = 1000;

/// Noise schedule configuration
///
/// Betas follow the "scaled linear" schedule used by Stable Diffusion:
/// linear in `sqrt(beta)` between `beta_start` and `beta_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    /// Number of training timesteps
    pub num_train_steps: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            beta_start: DEFAULT_BETA_START,
            beta_end: DEFAULT_BETA_END,
            num_train_steps: DEFAULT_TRAIN_STEPS,
        }
    }
}

impl ScheduleConfig {
    /// SD 1.x schedule
    pub fn sd1x() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<(), DecoderError> {
        for (name, beta) in [("beta_start", self.beta_start), ("beta_end", self.beta_end)] {
            if !beta.is_finite() || beta < 0.0 {
                return Err(DecoderError::NumericDomain(format!(
                    "{name} = {beta} has no real square root"
                )));
            }
            if beta >= 1.0 {
                return Err(DecoderError::NumericDomain(format!(
                    "{name} = {beta} leaves no signal (beta must be below 1)"
                )));
            }
        }
        if self.num_train_steps == 0 {
            return Err(DecoderError::NumericDomain(
                "num_train_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Betas of the scaled linear schedule
///
/// `linspace(sqrt(beta_start), sqrt(beta_end), n)` is computed in f64, cast
/// to f32, then squared in f32.
pub fn betas(config: &ScheduleConfig) -> Result<Vec<f32>, DecoderError> {
    config.validate()?;

    let n = config.num_train_steps;
    let start = config.beta_start.sqrt();
    let end = config.beta_end.sqrt();
    let step = if n > 1 {
        (end - start) / (n - 1) as f64
    } else {
        0.0
    };

    Ok((0..n)
        .map(|i| {
            // Pin the last point to `end` exactly
            let root = if i + 1 == n && n > 1 {
                end
            } else {
                start + step * i as f64
            };
            let root = root as f32;
            root * root
        })
        .collect())
}

/// Cumulative product of `1 - beta` over the schedule: ᾱₜ
///
/// Returns one value per training timestep. Fails with
/// [`DecoderError::NumericDomain`] for a negative beta bound or an empty
/// schedule.
pub fn alphas_cumprod(config: &ScheduleConfig) -> Result<Vec<f32>, DecoderError> {
    let betas = betas(config)?;

    let mut alphas_cumprod = Vec::with_capacity(betas.len());
    let mut cumprod = 1.0f32;
    for beta in betas {
        cumprod *= 1.0 - beta;
        alphas_cumprod.push(cumprod);
    }

    Ok(alphas_cumprod)
}

/// Precomputed noise schedule values
pub struct NoiseSchedule<B: Backend> {
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Tensor<B, 1>,
    /// Number of training steps
    pub num_train_steps: usize,
}

impl<B: Backend> NoiseSchedule<B> {
    /// Computes the table for `config` once; it is read-only afterwards
    pub fn new(config: &ScheduleConfig, device: &B::Device) -> Result<Self, DecoderError> {
        let values = alphas_cumprod(config)?;
        let n = values.len();

        log::debug!(
            "noise schedule: {n} steps, alpha_cumprod {:.6} -> {:.6}",
            values[0],
            values[n - 1]
        );

        Ok(Self {
            alphas_cumprod: Tensor::from_data(TensorData::new(values, [n]), device),
            num_train_steps: n,
        })
    }

    /// Create the default SD 1.x schedule
    pub fn sd1x(device: &B::Device) -> Result<Self, DecoderError> {
        Self::new(&ScheduleConfig::sd1x(), device)
    }

    /// Get alpha_cumprod at a specific timestep
    ///
    /// Fails with [`DecoderError::NumericDomain`] when `t >= num_train_steps`.
    pub fn alpha_cumprod_at(&self, t: usize) -> Result<Tensor<B, 1>, DecoderError> {
        check_timestep(t, self.num_train_steps)?;
        Ok(self.alphas_cumprod.clone().slice([t..t + 1]))
    }

    /// Get sqrt(alpha_cumprod) at timestep
    pub fn sqrt_alpha_cumprod_at(&self, t: usize) -> Result<Tensor<B, 1>, DecoderError> {
        Ok(self.alpha_cumprod_at(t)?.sqrt())
    }

    /// Get sqrt(1 - alpha_cumprod) at timestep
    pub fn sqrt_one_minus_alpha_cumprod_at(
        &self,
        t: usize,
    ) -> Result<Tensor<B, 1>, DecoderError> {
        Ok(self.alpha_cumprod_at(t)?.neg().add_scalar(1.0).sqrt())
    }

    /// The table as host values
    pub fn to_vec(&self) -> Vec<f32> {
        self.alphas_cumprod
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
    }
}

fn check_timestep(t: usize, num_train_steps: usize) -> Result<(), DecoderError> {
    if t >= num_train_steps {
        return Err(DecoderError::NumericDomain(format!(
            "timestep {t} is outside the {num_train_steps}-step schedule"
        )));
    }
    Ok(())
}

/// Generate timestep sequence for inference
///
/// Evenly spaced, from high noise to low noise.
pub fn inference_timesteps(num_inference_steps: usize, num_train_steps: usize) -> Vec<usize> {
    if num_inference_steps == 0 || num_train_steps == 0 {
        return Vec::new();
    }
    let step_ratio = (num_train_steps / num_inference_steps).max(1);
    (0..num_inference_steps)
        .rev()
        .map(|i| (i * step_ratio).min(num_train_steps - 1))
        .collect()
}

/// Sigma for each requested timestep: `sqrt((1 - ᾱ) / ᾱ)`
///
/// Fails with [`DecoderError::NumericDomain`] for a timestep past the end of
/// the table.
pub fn sigmas_from_alphas_cumprod(
    alphas_cumprod: &[f32],
    timesteps: &[usize],
) -> Result<Vec<f32>, DecoderError> {
    timesteps
        .iter()
        .map(|&t| {
            check_timestep(t, alphas_cumprod.len())?;
            let alpha = alphas_cumprod[t];
            Ok(((1.0 - alpha) / alpha).sqrt())
        })
        .collect()
}

/// Sigmas for a sampler run, with the trailing `0.0` of the final step
pub fn compute_sigmas(
    alphas_cumprod: &[f32],
    timesteps: &[usize],
) -> Result<Vec<f32>, DecoderError> {
    let mut sigmas = sigmas_from_alphas_cumprod(alphas_cumprod, timesteps)?;
    sigmas.push(0.0);
    Ok(sigmas)
}

/// Initialize a random latent tensor scaled by sigma
///
/// Creates a random normal tensor scaled by `sigma`, the starting point of
/// sampling (sigma_max is the initial noise level).
pub fn init_noise_latent<B: Backend>(
    shape: [usize; 4],
    sigma: f32,
    device: &B::Device,
) -> Tensor<B, 4> {
    let noise: Tensor<B, 4> =
        Tensor::random(shape, burn::tensor::Distribution::Normal(0.0, 1.0), device);
    noise.mul_scalar(sigma)
}
