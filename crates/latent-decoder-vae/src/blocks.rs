//! Decoder building blocks
//!
//! Residual, attention and upsampling blocks. Every block consumes its input
//! and returns a freshly computed tensor; the residual paths are the only
//! places an input is kept alive (an explicit `clone`).

use burn::nn::{
    PaddingConfig2d,
    conv::{Conv2d, Conv2dConfig},
};
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use latent_decoder_core::attention::SelfAttention;
use latent_decoder_core::error::DecoderError;
use latent_decoder_core::groupnorm::{GroupNorm, GroupNormSilu, NORM_GROUPS};

/// 3x3 convolution, stride 1, padding 1 (spatial dims preserved)
pub fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// 1x1 convolution, no padding
pub fn conv1x1<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device)
}

/// `(in_channels, out_channels, kernel_size)` of a convolution, read from its weight
pub fn conv_shape<B: Backend>(conv: &Conv2d<B>) -> (usize, usize, usize) {
    let [out_channels, in_channels, kernel_size, _] = conv.weight.val().dims();
    (in_channels, out_channels, kernel_size)
}

/// Resnet block with skip connection
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub norm1: GroupNormSilu<B>,
    pub conv1: Conv2d<B>,
    pub norm2: GroupNormSilu<B>,
    pub conv2: Conv2d<B>,
    /// 1x1 projection, present only when the channel count changes
    pub skip_conv: Option<Conv2d<B>>,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl<B: Backend> ResidualBlock<B> {
    /// Creates a new resnet block with optional skip connection
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> Result<Self, DecoderError> {
        let norm1 = GroupNormSilu::new(in_channels, device)?;
        let conv1 = conv3x3(in_channels, out_channels, device);

        let norm2 = GroupNormSilu::new(out_channels, device)?;
        let conv2 = conv3x3(out_channels, out_channels, device);

        let skip_conv = if in_channels != out_channels {
            Some(conv1x1(in_channels, out_channels, device))
        } else {
            None
        };

        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            skip_conv,
            in_channels,
            out_channels,
        })
    }

    /// Forward pass with residual connection
    ///
    /// `[batch, in_channels, h, w] -> [batch, out_channels, h, w]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.skip_conv {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let h = self.norm1.forward(x);
        let h = self.conv1.forward(h);

        let h = self.norm2.forward(h);
        let h = self.conv2.forward(h);

        h.add(residual)
    }
}

/// Self-attention over the spatial positions of a feature map
///
/// Normalizes (no activation), treats the `h*w` positions as a sequence of
/// `channels`-wide tokens, runs single-head self-attention and adds the
/// un-normalized input back.
#[derive(Module, Debug)]
pub struct AttentionBlock<B: Backend> {
    pub norm: GroupNorm<B>,
    pub attention: SelfAttention<B>,
    pub channels: usize,
}

impl<B: Backend> AttentionBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Result<Self, DecoderError> {
        Ok(Self {
            norm: GroupNorm::new(NORM_GROUPS, channels, device)?,
            attention: SelfAttention::single_head(channels, device)?,
            channels,
        })
    }

    /// Shape-preserving: `[b, c, h, w] -> [b, c, h, w]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let residual = x.clone();

        let x = self.norm.forward(x);

        // [b, c, h, w] -> [b, c, h*w] -> [b, h*w, c]
        let tokens = x.reshape([b, c, h * w]).swap_dims(1, 2);
        let tokens = self.attention.forward(tokens);

        // [b, h*w, c] -> [b, c, h, w]
        let out = tokens.swap_dims(1, 2).reshape([b, c, h, w]);

        out.add(residual)
    }
}

/// Nearest neighbor upsampling by an integer factor
///
/// Each input pixel is replicated into a `scale x scale` block.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>, scale: usize) -> Tensor<B, 4> {
    let [_b, _c, h, w] = x.dims();

    interpolate(
        x,
        [h * scale, w * scale],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

/// Integer upsampling followed by a smoothing 3x3 conv
#[derive(Module, Debug)]
pub struct UpsamplingStage<B: Backend> {
    pub conv: Conv2d<B>,
    pub scale: usize,
}

impl<B: Backend> UpsamplingStage<B> {
    /// Creates a new upsampling stage; `scale` must be at least 1
    pub fn new(channels: usize, scale: usize, device: &B::Device) -> Result<Self, DecoderError> {
        if scale == 0 {
            return Err(DecoderError::InvalidConfig(
                "upsampling scale factor must be a positive integer".to_string(),
            ));
        }

        Ok(Self {
            conv: conv3x3(channels, channels, device),
            scale,
        })
    }

    pub fn channels(&self) -> usize {
        conv_shape(&self.conv).0
    }

    /// `[b, c, h, w] -> [b, c, h*scale, w*scale]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = upsample_nearest(x, self.scale);
        self.conv.forward(x)
    }
}
