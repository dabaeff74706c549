//! Group normalization implementation
//!
//! Provides group normalization as used in the VAE decoder, and the fused
//! normalization + SiLU unit that precedes every decoder convolution.
//! Divides channels into groups and normalizes within each group.

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::DType;

use crate::error::DecoderError;
use crate::silu::silu;

/// Number of normalization groups used throughout the decoder
pub const NORM_GROUPS: usize = 32;

/// Epsilon matching the reference network's normalization layers
pub const NORM_EPS: f64 = 1e-5;

/// Group normalization module
///
/// Divides channels into groups and normalizes each group independently.
/// This is commonly used in diffusion models (UNet, VAE) as an alternative
/// to batch normalization that works well with small batch sizes.
///
/// # Formula
///
/// For input with C channels divided into G groups:
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
///
/// # Reference
///
/// "Group Normalization" - Wu & He, 2018
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of groups to divide channels into
    pub num_groups: usize,
    /// Scale parameter (gamma), shape [num_channels]
    pub weight: Param<Tensor<B, 1>>,
    /// Bias parameter (beta), shape [num_channels]
    pub bias: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Creates a new group normalization module
    ///
    /// # Arguments
    ///
    /// * `num_groups` - Number of groups to divide channels into (typically 32)
    /// * `num_channels` - Total number of input channels (must be divisible by num_groups)
    /// * `device` - Device to create tensors on
    pub fn new(
        num_groups: usize,
        num_channels: usize,
        device: &B::Device,
    ) -> Result<Self, DecoderError> {
        if num_groups == 0 || num_channels == 0 || num_channels % num_groups != 0 {
            return Err(DecoderError::IndivisibleChannels {
                channels: num_channels,
                groups: num_groups,
            });
        }

        Ok(Self {
            num_groups,
            weight: Param::from_tensor(Tensor::ones([num_channels], device)),
            bias: Param::from_tensor(Tensor::zeros([num_channels], device)),
            eps: NORM_EPS,
        })
    }

    /// Number of channels this layer normalizes
    pub fn num_channels(&self) -> usize {
        let [channels] = self.weight.val().dims();
        channels
    }

    /// Normalizes each group to zero mean and unit variance, without the affine
    pub fn normalize(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;

        // [batch, num_groups, group_size * height * width]
        let x = x.reshape([batch, self.num_groups, group_size * height * width]);

        // Statistics in f32 so large half-precision reductions cannot overflow
        let original_dtype = x.dtype();
        let x_f32 = x.clone().cast(DType::F32);
        let mean_f32 = x_f32.clone().mean_dim(2);
        let diff_f32 = x_f32.sub(mean_f32.clone());
        let var_f32 = diff_f32.clone().mul(diff_f32).mean_dim(2);

        let mean = mean_f32.cast(original_dtype);
        let var = var_f32.cast(original_dtype);

        let x = x.sub(mean).div(var.add_scalar(self.eps).sqrt());

        x.reshape([batch, channels, height, width])
    }

    /// Applies group normalization to a 4D tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, channels, height, width]`
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = self.num_channels();
        let x = self.normalize(x);

        let weight = self.weight.val().reshape([1, channels, 1, 1]);
        let bias = self.bias.val().reshape([1, channels, 1, 1]);

        x.mul(weight).add(bias)
    }
}

/// Group normalization followed by SiLU
///
/// The pre-convolution unit of every residual block and the decoder output
/// head. Shape preserving.
#[derive(Module, Debug)]
pub struct GroupNormSilu<B: Backend> {
    pub norm: GroupNorm<B>,
}

impl<B: Backend> GroupNormSilu<B> {
    /// Creates the unit with [`NORM_GROUPS`] groups over `channels`
    pub fn new(channels: usize, device: &B::Device) -> Result<Self, DecoderError> {
        Ok(Self {
            norm: GroupNorm::new(NORM_GROUPS, channels, device)?,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.norm.num_channels()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        silu(self.norm.forward(x))
    }
}
