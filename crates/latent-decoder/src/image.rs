//! Image tensor utilities
//!
//! Value-range mapping, channel-order permutation and conversion of decoded
//! tensors to 8-bit RGB images.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use ::image::RgbImage;

use latent_decoder_core::error::DecoderError;

/// Affine-maps `x` from `old_range` to `new_range`
///
/// With `clamp`, the result is limited to `new_range`. Fails when
/// `old_range` is empty (`min == max`) or either range is not finite.
pub fn rescale<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    old_range: (f64, f64),
    new_range: (f64, f64),
    clamp: bool,
) -> Result<Tensor<B, D>, DecoderError> {
    let (old_min, old_max) = old_range;
    let (new_min, new_max) = new_range;

    if [old_min, old_max, new_min, new_max]
        .iter()
        .any(|v| !v.is_finite())
    {
        return Err(DecoderError::NumericDomain(format!(
            "rescale ranges must be finite, got {old_range:?} -> {new_range:?}"
        )));
    }
    if old_max == old_min {
        return Err(DecoderError::NumericDomain(format!(
            "cannot rescale from the empty range {old_range:?}"
        )));
    }

    let x = x
        .sub_scalar(old_min)
        .mul_scalar((new_max - new_min) / (old_max - old_min))
        .add_scalar(new_min);

    if clamp {
        Ok(x.clamp(new_min.min(new_max), new_min.max(new_max)))
    } else {
        Ok(x)
    }
}

/// Position of the channel axis in a 4D image tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// `[N, C, H, W]`
    First,
    /// `[N, H, W, C]`
    Last,
}

impl ChannelLayout {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelLayout::First => "first",
            ChannelLayout::Last => "last",
        }
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChannelLayout {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(ChannelLayout::First),
            "last" => Ok(ChannelLayout::Last),
            other => Err(DecoderError::InvalidEnum {
                kind: "channel layout",
                value: other.to_string(),
                expected: &["first", "last"],
            }),
        }
    }
}

/// Moves the channel axis to `to`
///
/// `First`: `[N, H, W, C] -> [N, C, H, W]`. `Last`: `[N, C, H, W] -> [N, H, W, C]`.
pub fn move_channel<B: Backend>(image: Tensor<B, 4>, to: ChannelLayout) -> Tensor<B, 4> {
    match to {
        ChannelLayout::First => image.permute([0, 3, 1, 2]),
        ChannelLayout::Last => image.permute([0, 2, 3, 1]),
    }
}

/// Converts a decoded `[N, 3, H, W]` batch in `[-1, 1]` to RGB images
pub fn to_rgb8<B: Backend>(images: Tensor<B, 4>) -> Result<Vec<RgbImage>, DecoderError> {
    let [batch, channels, height, width] = images.dims();
    if channels != 3 {
        return Err(DecoderError::channels("rgb conversion", 3, channels));
    }
    if height == 0 || width == 0 {
        return Err(DecoderError::ShapeMismatch {
            context: "rgb conversion (empty image)".to_string(),
            expected: vec![batch, 3, height.max(1), width.max(1)],
            actual: vec![batch, channels, height, width],
        });
    }

    let pixels = rescale(images, (-1.0, 1.0), (0.0, 255.0), true)?;
    let pixels = move_channel(pixels, ChannelLayout::Last);

    let values = pixels
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| DecoderError::NumericDomain(format!("reading pixels: {e:?}")))?;

    log::debug!("converting {batch} decoded images of {width}x{height} to rgb8");

    let frame = height * width * 3;
    values
        .chunks_exact(frame)
        .take(batch)
        .map(|chunk| {
            let raw: Vec<u8> = chunk.iter().map(|&v| v as u8).collect();
            RgbImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
                DecoderError::ShapeMismatch {
                    context: "rgb buffer".to_string(),
                    expected: vec![frame],
                    actual: vec![chunk.len()],
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn scalar(v: f32) -> Tensor<TestBackend, 1> {
        Tensor::from_floats([v], &Default::default())
    }

    fn first(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_rescale() {
        let y = rescale(scalar(5.0), (0.0, 10.0), (0.0, 1.0), false).unwrap();
        assert_eq!(first(y), 0.5);

        let y = rescale(scalar(15.0), (0.0, 10.0), (0.0, 1.0), false).unwrap();
        assert!((first(y) - 1.5).abs() < 1e-6);

        let y = rescale(scalar(15.0), (0.0, 10.0), (0.0, 1.0), true).unwrap();
        assert_eq!(first(y), 1.0);
    }

    #[test]
    fn test_rescale_image_range() {
        let y = rescale(scalar(-1.0), (-1.0, 1.0), (0.0, 255.0), true).unwrap();
        assert_eq!(first(y), 0.0);
        let y = rescale(scalar(1.0), (-1.0, 1.0), (0.0, 255.0), true).unwrap();
        assert_eq!(first(y), 255.0);
    }

    #[test]
    fn test_rescale_rejects_empty_range() {
        assert!(matches!(
            rescale(scalar(1.0), (2.0, 2.0), (0.0, 1.0), false),
            Err(DecoderError::NumericDomain(_))
        ));
        assert!(rescale(scalar(1.0), (0.0, f64::INFINITY), (0.0, 1.0), false).is_err());
    }

    #[test]
    fn test_channel_layout_parse() {
        assert_eq!("first".parse::<ChannelLayout>().unwrap(), ChannelLayout::First);
        assert_eq!("last".parse::<ChannelLayout>().unwrap(), ChannelLayout::Last);
        assert!(matches!(
            "middle".parse::<ChannelLayout>(),
            Err(DecoderError::InvalidEnum { .. })
        ));
        assert_eq!(ChannelLayout::Last.to_string(), "last");
    }

    #[test]
    fn test_move_channel_round_trip() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 4>::random([2, 5, 7, 3], Distribution::Default, &device);

        let first = move_channel(t.clone(), ChannelLayout::First);
        assert_eq!(first.dims(), [2, 3, 5, 7]);

        let back = move_channel(first, ChannelLayout::Last);
        assert_eq!(back.dims(), [2, 5, 7, 3]);

        let a: Vec<f32> = t.into_data().to_vec().unwrap();
        let b: Vec<f32> = back.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_to_rgb8() {
        let device = Default::default();
        // One 1x2 image: red pixel, then a saturated white one
        let t = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 2.0]], [[-1.0, 1.0]], [[-1.0, 1.0]]]],
            &device,
        );

        let images = to_rgb8(t).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].dimensions(), (2, 1));
        assert_eq!(images[0].get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(images[0].get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_to_rgb8_rejects_non_rgb() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        assert!(matches!(
            to_rgb8(t),
            Err(DecoderError::ShapeMismatch { .. })
        ));
    }
}
