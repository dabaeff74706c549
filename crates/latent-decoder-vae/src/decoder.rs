//! VAE Decoder: latent -> image
//!
//! Decodes 4-channel latent representations to 3-channel RGB images.
//!
//! The decoder is an ordered, immutable list of [`Stage`]s. The list is
//! derived from [`DecoderConfig`] by [`DecoderConfig::stage_plan`]; for the
//! SD 1.x configuration it is:
//!
//! ```text
//! conv 4->4 (1x1), conv 4->512 (3x3)
//! Residual(512,512), Attention(512), 4 x Residual(512,512)
//! Upsample x2 + conv, 3 x Residual(512,512)
//! Upsample x2 + conv, Residual(512,256), 2 x Residual(256,256)
//! Upsample x2 + conv, Residual(256,128), 2 x Residual(128,128)
//! GroupNorm+SiLU(128), conv 128->3
//! ```

use std::fmt;
use std::path::Path;

use burn::nn::conv::Conv2d;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use latent_decoder_core::error::{DecoderError, ensure_channels};
use latent_decoder_core::groupnorm::{GroupNormSilu, NORM_GROUPS};

use crate::blocks::{
    AttentionBlock, ResidualBlock, UpsamplingStage, conv_shape, conv1x1, conv3x3,
};

/// VAE scaling factors for different model versions
pub mod scaling {
    /// SD 1.x / SD 2.x scaling factor
    pub const SD1X: f64 = 0.18215;
    /// SDXL scaling factor
    pub const SDXL: f64 = 0.13025;
}

/// f16 saturates just above this; used by [`Decoder::with_clamp_overflow`]
const F16_SAFE_MAX: f64 = 65000.0;

/// VAE Decoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Input latent channels (typically 4)
    pub latent_channels: usize,
    /// Output image channels (typically 3 for RGB)
    pub out_channels: usize,
    /// Base channel multiplier
    pub base_channels: usize,
    /// Channel multipliers per resolution level (encoder order, lowest first)
    pub channel_mult: Vec<usize>,
    /// Number of resnet blocks per resolution level
    pub num_res_blocks: usize,
    /// Spatial factor of each upsampling stage
    pub upsample_factor: usize,
    /// Latents are divided by this before decoding
    pub scale_factor: f64,
    /// Whether the 1x1 latent-space conv precedes `conv_in`
    pub post_quant_conv: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            out_channels: 3,
            base_channels: 128,
            channel_mult: vec![1, 2, 4, 4],
            num_res_blocks: 3, // SD 1.x VAE has 3 res blocks per up block
            upsample_factor: 2,
            scale_factor: scaling::SD1X,
            post_quant_conv: true,
        }
    }
}

impl DecoderConfig {
    /// SD 1.x VAE decoder config
    pub fn sd1x() -> Self {
        Self::default()
    }

    /// SDXL VAE decoder config (same architecture, different scaling)
    pub fn sdxl() -> Self {
        Self {
            scale_factor: scaling::SDXL,
            ..Self::default()
        }
    }

    /// Parses a config from JSON; missing fields take the SD 1.x defaults
    pub fn from_json_str(json: &str) -> Result<Self, DecoderError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DecoderError::InvalidConfig(format!("malformed decoder config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DecoderError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DecoderError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Channel count at the lowest resolution (where decoding starts)
    pub fn block_channels(&self) -> usize {
        self.base_channels * self.channel_mult.last().copied().unwrap_or(1)
    }

    /// Overall spatial upscaling from latent to image
    pub fn spatial_factor(&self) -> usize {
        let levels = self.channel_mult.len().saturating_sub(1) as u32;
        self.upsample_factor.pow(levels)
    }

    /// The ordered stage list this configuration describes
    pub fn stage_plan(&self) -> Vec<StageSpec> {
        let ch = self.base_channels;
        let block_in = self.block_channels();
        let mut plan = Vec::new();

        if self.post_quant_conv {
            plan.push(StageSpec::Conv {
                in_channels: self.latent_channels,
                out_channels: self.latent_channels,
                kernel_size: 1,
            });
        }

        // Input conv: latent_channels -> block_in
        plan.push(StageSpec::Conv {
            in_channels: self.latent_channels,
            out_channels: block_in,
            kernel_size: 3,
        });

        // Mid block
        plan.push(StageSpec::Residual {
            in_channels: block_in,
            out_channels: block_in,
        });
        plan.push(StageSpec::Attention { channels: block_in });
        plan.push(StageSpec::Residual {
            in_channels: block_in,
            out_channels: block_in,
        });

        // Up blocks (reverse order, upsampling between levels)
        let mut in_ch = block_in;
        let levels = self.channel_mult.len();
        for (i, &mult) in self.channel_mult.iter().rev().enumerate() {
            let out_ch = ch * mult;

            // First block handles channel change
            plan.push(StageSpec::Residual {
                in_channels: in_ch,
                out_channels: out_ch,
            });
            for _ in 1..self.num_res_blocks {
                plan.push(StageSpec::Residual {
                    in_channels: out_ch,
                    out_channels: out_ch,
                });
            }

            // Don't upsample on last block
            if i + 1 < levels {
                plan.push(StageSpec::Upsample {
                    channels: out_ch,
                    scale: self.upsample_factor,
                });
            }
            in_ch = out_ch;
        }

        // Output layers
        plan.push(StageSpec::NormActivation { channels: in_ch });
        plan.push(StageSpec::Conv {
            in_channels: in_ch,
            out_channels: self.out_channels,
            kernel_size: 3,
        });

        plan
    }

    /// Checks the static contract of the stage plan
    ///
    /// Every normalized channel count must be divisible by 32 and each
    /// stage's input channels must equal the previous stage's output.
    pub fn validate(&self) -> Result<(), DecoderError> {
        if self.channel_mult.is_empty() {
            return Err(DecoderError::InvalidConfig(
                "channel_mult must have at least one level".to_string(),
            ));
        }
        if self.num_res_blocks == 0 {
            return Err(DecoderError::InvalidConfig(
                "num_res_blocks must be at least 1".to_string(),
            ));
        }
        if self.upsample_factor == 0 {
            return Err(DecoderError::InvalidConfig(
                "upsample_factor must be a positive integer".to_string(),
            ));
        }
        check_scale_factor(self.scale_factor)?;

        validate_plan(&self.stage_plan(), self.latent_channels, self.out_channels)
    }
}

/// Fails with [`DecoderError::NumericDomain`] unless `scale` is positive and finite
fn check_scale_factor(scale: f64) -> Result<(), DecoderError> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(DecoderError::NumericDomain(format!(
            "latent scale factor must be positive and finite, got {scale}"
        )));
    }
    Ok(())
}

/// Checks channel chaining and group divisibility of an ordered plan
pub fn validate_plan(
    plan: &[StageSpec],
    latent_channels: usize,
    out_channels: usize,
) -> Result<(), DecoderError> {
    let mut channels = latent_channels;

    for (i, spec) in plan.iter().enumerate() {
        if spec.in_channels() != channels {
            return Err(DecoderError::InvalidConfig(format!(
                "stage {i} ({spec}) expects {} input channels but receives {channels}",
                spec.in_channels()
            )));
        }
        let indivisible = spec
            .normalized_channels()
            .into_iter()
            .find(|c| c % NORM_GROUPS != 0);
        if let Some(bad) = indivisible {
            return Err(DecoderError::IndivisibleChannels {
                channels: bad,
                groups: NORM_GROUPS,
            });
        }
        channels = spec.out_channels();
    }

    if channels != out_channels {
        return Err(DecoderError::InvalidConfig(format!(
            "decoder produces {channels} channels, expected {out_channels}"
        )));
    }

    Ok(())
}

/// Static description of one decoder stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSpec {
    Conv {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    },
    Residual {
        in_channels: usize,
        out_channels: usize,
    },
    Attention {
        channels: usize,
    },
    Upsample {
        channels: usize,
        scale: usize,
    },
    NormActivation {
        channels: usize,
    },
}

impl StageSpec {
    pub fn in_channels(&self) -> usize {
        match *self {
            StageSpec::Conv { in_channels, .. } | StageSpec::Residual { in_channels, .. } => {
                in_channels
            }
            StageSpec::Attention { channels }
            | StageSpec::Upsample { channels, .. }
            | StageSpec::NormActivation { channels } => channels,
        }
    }

    pub fn out_channels(&self) -> usize {
        match *self {
            StageSpec::Conv { out_channels, .. } | StageSpec::Residual { out_channels, .. } => {
                out_channels
            }
            StageSpec::Attention { channels }
            | StageSpec::Upsample { channels, .. }
            | StageSpec::NormActivation { channels } => channels,
        }
    }

    /// Factor applied to height and width
    pub fn spatial_scale(&self) -> usize {
        match *self {
            StageSpec::Upsample { scale, .. } => scale,
            _ => 1,
        }
    }

    /// Channel counts this stage group-normalizes
    fn normalized_channels(&self) -> Vec<usize> {
        match *self {
            StageSpec::Residual {
                in_channels,
                out_channels,
            } => vec![in_channels, out_channels],
            StageSpec::Attention { channels } | StageSpec::NormActivation { channels } => {
                vec![channels]
            }
            StageSpec::Conv { .. } | StageSpec::Upsample { .. } => Vec::new(),
        }
    }

    /// Number of sequential layers this stage spans in the reference network
    ///
    /// Upsampling is a parameter-free resize plus a conv, and the output head
    /// is a norm plus a parameter-free SiLU; both occupy two slots.
    pub fn reference_layers(&self) -> usize {
        match self {
            StageSpec::Upsample { .. } | StageSpec::NormActivation { .. } => 2,
            _ => 1,
        }
    }

    /// Short stage-kind name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            StageSpec::Conv { .. } => "conv",
            StageSpec::Residual { .. } => "residual",
            StageSpec::Attention { .. } => "attention",
            StageSpec::Upsample { .. } => "upsample",
            StageSpec::NormActivation { .. } => "norm_silu",
        }
    }
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StageSpec::Conv {
                in_channels,
                out_channels,
                kernel_size,
            } => write!(
                f,
                "conv {in_channels}->{out_channels} ({kernel_size}x{kernel_size})"
            ),
            StageSpec::Residual {
                in_channels,
                out_channels,
            } => write!(f, "residual({in_channels}, {out_channels})"),
            StageSpec::Attention { channels } => write!(f, "attention({channels})"),
            StageSpec::Upsample { channels, scale } => {
                write!(f, "upsample x{scale} + conv {channels}->{channels}")
            }
            StageSpec::NormActivation { channels } => write!(f, "groupnorm+silu({channels})"),
        }
    }
}

/// One block of the decoder pipeline
#[derive(Module, Debug)]
pub enum Stage<B: Backend> {
    Conv(Conv2d<B>),
    Residual(ResidualBlock<B>),
    Attention(AttentionBlock<B>),
    Upsample(UpsamplingStage<B>),
    NormActivation(GroupNormSilu<B>),
}

impl<B: Backend> Stage<B> {
    /// Builds a freshly initialized stage
    pub fn new(spec: &StageSpec, device: &B::Device) -> Result<Self, DecoderError> {
        let stage = match *spec {
            StageSpec::Conv {
                in_channels,
                out_channels,
                kernel_size: 1,
            } => Stage::Conv(conv1x1(in_channels, out_channels, device)),
            StageSpec::Conv {
                in_channels,
                out_channels,
                kernel_size: 3,
            } => Stage::Conv(conv3x3(in_channels, out_channels, device)),
            StageSpec::Conv { kernel_size, .. } => {
                return Err(DecoderError::InvalidConfig(format!(
                    "unsupported conv kernel size {kernel_size}"
                )));
            }
            StageSpec::Residual {
                in_channels,
                out_channels,
            } => Stage::Residual(ResidualBlock::new(in_channels, out_channels, device)?),
            StageSpec::Attention { channels } => {
                Stage::Attention(AttentionBlock::new(channels, device)?)
            }
            StageSpec::Upsample { channels, scale } => {
                Stage::Upsample(UpsamplingStage::new(channels, scale, device)?)
            }
            StageSpec::NormActivation { channels } => {
                Stage::NormActivation(GroupNormSilu::new(channels, device)?)
            }
        };
        Ok(stage)
    }

    /// Describes the stage from its parameters
    pub fn spec(&self) -> StageSpec {
        match self {
            Stage::Conv(conv) => {
                let (in_channels, out_channels, kernel_size) = conv_shape(conv);
                StageSpec::Conv {
                    in_channels,
                    out_channels,
                    kernel_size,
                }
            }
            Stage::Residual(block) => StageSpec::Residual {
                in_channels: block.in_channels,
                out_channels: block.out_channels,
            },
            Stage::Attention(block) => StageSpec::Attention {
                channels: block.channels,
            },
            Stage::Upsample(up) => StageSpec::Upsample {
                channels: up.channels(),
                scale: up.scale,
            },
            Stage::NormActivation(unit) => StageSpec::NormActivation {
                channels: unit.num_channels(),
            },
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Stage::Conv(conv) => conv.forward(x),
            Stage::Residual(block) => block.forward(x),
            Stage::Attention(block) => block.forward(x),
            Stage::Upsample(up) => up.forward(x),
            Stage::NormActivation(unit) => unit.forward(x),
        }
    }
}

/// VAE Decoder
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub stages: Vec<Stage<B>>,
    pub latent_channels: usize,
    pub scale_factor: f64,
    /// Skip the attention stage to reduce memory (small quality impact)
    pub skip_attention: bool,
    /// Clamp activations after each stage to stay within f16 range
    pub clamp_overflow: bool,
}

impl<B: Backend> Decoder<B> {
    /// Creates a new VAE decoder with freshly initialized parameters
    ///
    /// # Arguments
    ///
    /// * `config` - Decoder configuration
    /// * `device` - Device to create tensors on
    pub fn new(config: &DecoderConfig, device: &B::Device) -> Result<Self, DecoderError> {
        config.validate()?;

        let stages = config
            .stage_plan()
            .iter()
            .map(|spec| Stage::new(spec, device))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "initialized decoder: {} stages, {}x upscaling",
            stages.len(),
            config.spatial_factor()
        );

        Self::from_stages(
            stages,
            config.latent_channels,
            config.out_channels,
            config.scale_factor,
        )
    }

    /// Assembles a decoder from already-built stages, checking the channel chain
    pub fn from_stages(
        stages: Vec<Stage<B>>,
        latent_channels: usize,
        out_channels: usize,
        scale_factor: f64,
    ) -> Result<Self, DecoderError> {
        check_scale_factor(scale_factor)?;
        let plan: Vec<StageSpec> = stages.iter().map(Stage::spec).collect();
        validate_plan(&plan, latent_channels, out_channels)?;

        Ok(Self {
            stages,
            latent_channels,
            scale_factor,
            skip_attention: false,
            clamp_overflow: false,
        })
    }

    /// Set whether to skip the attention stage (reduces VRAM usage)
    pub fn with_skip_attention(mut self, skip: bool) -> Self {
        self.skip_attention = skip;
        self
    }

    /// Enable aggressive clamping to prevent f16 overflow
    pub fn with_clamp_overflow(mut self, clamp: bool) -> Self {
        self.clamp_overflow = clamp;
        self
    }

    /// The stage list, as static descriptions
    pub fn plan(&self) -> Vec<StageSpec> {
        self.stages.iter().map(Stage::spec).collect()
    }

    /// Output channel count
    pub fn out_channels(&self) -> usize {
        self.stages
            .last()
            .map(|s| s.spec().out_channels())
            .unwrap_or(self.latent_channels)
    }

    /// Overall spatial upscaling factor
    pub fn spatial_factor(&self) -> usize {
        self.stages.iter().map(|s| s.spec().spatial_scale()).product()
    }

    /// Clamp tensor to prevent f16 overflow (when clamp_overflow is enabled)
    fn clamp_if_enabled(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.clamp_overflow {
            x.clamp(-F16_SAFE_MAX, F16_SAFE_MAX)
        } else {
            x
        }
    }

    /// Entry check: `[N, latent_channels, h, w]` with non-empty spatial dims
    fn check_latent(&self, dims: [usize; 4]) -> Result<(), DecoderError> {
        ensure_channels("decoder input", dims, self.latent_channels)?;
        let [batch, channels, height, width] = dims;
        if height == 0 || width == 0 {
            return Err(DecoderError::ShapeMismatch {
                context: "decoder input (empty latent)".to_string(),
                expected: vec![batch, channels, height.max(1), width.max(1)],
                actual: dims.to_vec(),
            });
        }
        Ok(())
    }

    fn run_stages(&self, z: Tensor<B, 4>, check_values: bool) -> Tensor<B, 4> {
        let mut h = z;

        for (i, stage) in self.stages.iter().enumerate() {
            if self.skip_attention && matches!(stage, Stage::Attention(_)) {
                log::debug!("[vae] stage {i}: skipping attention");
                continue;
            }

            h = stage.forward(h);
            h = self.clamp_if_enabled(h);

            log::debug!("[vae] stage {i} {}: {:?}", stage.spec().kind(), h.dims());
            if check_values {
                check_nan(&format!("stage {i} ({})", stage.spec()), &h);
            }
        }

        h
    }

    /// Decode latent to image (raw, no scaling applied)
    ///
    /// Input: [batch, latent_channels, h, w] latent (already unscaled)
    /// Output: [batch, 3, h*8, w*8] image (nominally in [-1, 1], not clamped)
    pub fn forward_raw(&self, z: Tensor<B, 4>) -> Result<Tensor<B, 4>, DecoderError> {
        self.check_latent(z.dims())?;
        Ok(self.run_stages(z, false))
    }

    /// Decode latent to image with the configured latent scaling
    ///
    /// Every element is divided by the scale factor (0.18215 for SD 1.x)
    /// before the first stage.
    ///
    /// Input: [batch, latent_channels, h, w] latent
    /// Output: [batch, 3, h*8, w*8] image
    pub fn forward(&self, z: Tensor<B, 4>) -> Result<Tensor<B, 4>, DecoderError> {
        self.forward_scaled(z, self.scale_factor)
    }

    /// Decode latent to image with a custom scaling factor
    ///
    /// `scale` must be positive and finite.
    pub fn forward_scaled(
        &self,
        z: Tensor<B, 4>,
        scale: f64,
    ) -> Result<Tensor<B, 4>, DecoderError> {
        check_scale_factor(scale)?;
        self.forward_raw(z.div_scalar(scale))
    }

    /// Like [`forward`](Self::forward) but logs a warning for every stage
    /// whose output contains NaN or Inf values (reads activations back from
    /// the device, so it is slow)
    pub fn forward_checked(&self, z: Tensor<B, 4>) -> Result<Tensor<B, 4>, DecoderError> {
        self.check_latent(z.dims())?;
        let z = z.div_scalar(self.scale_factor);
        check_nan("input latent", &z);
        Ok(self.run_stages(z, true))
    }

    /// Decode and convert to [0, 255] range
    pub fn decode_to_image(&self, z: Tensor<B, 4>) -> Result<Tensor<B, 4>, DecoderError> {
        let img = self.forward(z)?;
        // Clamp to [-1, 1] range and convert to [0, 255]
        Ok(img.clamp(-1.0, 1.0).add_scalar(1.0).mul_scalar(127.5))
    }
}

fn check_nan<B: Backend>(name: &str, t: &Tensor<B, 4>) {
    let Ok(data) = t.clone().into_data().convert::<f32>().to_vec::<f32>() else {
        return;
    };
    let nan_count = data.iter().filter(|x| x.is_nan()).count();
    let inf_count = data.iter().filter(|x| x.is_infinite()).count();
    if nan_count > 0 || inf_count > 0 {
        log::warn!(
            "[vae] {} has {} NaN, {} Inf out of {} values",
            name,
            nan_count,
            inf_count,
            data.len()
        );
    } else if log::log_enabled!(log::Level::Trace) {
        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        log::trace!("[vae] {name} stats: min={min:.3}, max={max:.3}");
    }
}
