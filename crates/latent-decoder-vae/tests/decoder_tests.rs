//! End-to-end decoder tests on a reduced-width configuration.
//!
//! The reduced config keeps the SD 1.x topology (4 levels, three 2x
//! upsamplings, attention in the mid block) with 32/64 channels so the tests
//! run quickly on the CPU backend.

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_ndarray::NdArray;

use latent_decoder_core::DecoderError;
use latent_decoder_vae::{Decoder, DecoderConfig, Stage, StageSpec, scaling};

type TestBackend = NdArray<f32>;

fn small_config() -> DecoderConfig {
    DecoderConfig {
        base_channels: 32,
        channel_mult: vec![1, 1, 2, 2],
        num_res_blocks: 1,
        ..DecoderConfig::sd1x()
    }
}

fn to_vec(t: Tensor<TestBackend, 4>) -> Vec<f32> {
    t.into_data().to_vec().unwrap()
}

#[test]
fn test_forward_output_shape_is_8x() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device).unwrap();
    assert_eq!(decoder.spatial_factor(), 8);
    assert_eq!(decoder.out_channels(), 3);

    for [n, h, w] in [[1, 1, 1], [2, 2, 3], [1, 4, 2]] {
        let z = Tensor::<TestBackend, 4>::random([n, 4, h, w], Distribution::Default, &device);
        let img = decoder.forward(z).unwrap();
        assert_eq!(img.dims(), [n, 3, 8 * h, 8 * w]);
    }
}

#[test]
fn test_forward_rejects_wrong_latent_channels() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device).unwrap();

    let z = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 2], &device);
    let err = decoder.forward(z).unwrap_err();
    assert!(matches!(
        err,
        DecoderError::ShapeMismatch { ref expected, ref actual, .. }
            if expected == &vec![4] && actual == &vec![3]
    ));
}

#[test]
fn test_forward_scaled_rejects_non_positive_scale() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device).unwrap();

    for scale in [0.0, -0.18215, f64::NAN, f64::INFINITY] {
        let z = Tensor::<TestBackend, 4>::ones([1, 4, 1, 1], &device);
        assert!(
            matches!(
                decoder.forward_scaled(z, scale),
                Err(DecoderError::NumericDomain(_))
            ),
            "scale {scale} accepted"
        );
    }
}

#[test]
fn test_from_stages_rejects_zero_scale_factor() {
    let device = Default::default();
    let stages = Decoder::<TestBackend>::new(&small_config(), &device)
        .unwrap()
        .stages;

    let result = Decoder::from_stages(stages, 4, 3, 0.0);
    assert!(matches!(result, Err(DecoderError::NumericDomain(_))));
}

#[test]
fn test_forward_rejects_empty_latent() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device).unwrap();

    for [h, w] in [[0, 2], [2, 0]] {
        let z = Tensor::<TestBackend, 4>::zeros([1, 4, h, w], &device);
        assert!(matches!(
            decoder.forward_raw(z.clone()),
            Err(DecoderError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            decoder.forward_checked(z),
            Err(DecoderError::ShapeMismatch { .. })
        ));
    }
}

#[test]
fn test_forward_divides_by_scale_factor() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device).unwrap();
    assert_eq!(decoder.scale_factor, scaling::SD1X);

    let z = Tensor::<TestBackend, 4>::random([1, 4, 2, 2], Distribution::Default, &device);
    let scaled = to_vec(decoder.forward(z.clone()).unwrap());
    let raw = to_vec(decoder.forward_raw(z.div_scalar(0.18215)).unwrap());

    assert_eq!(scaled, raw);
}

#[test]
fn test_forward_is_deterministic() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device).unwrap();

    let z = Tensor::<TestBackend, 4>::random([1, 4, 2, 2], Distribution::Default, &device);
    let a = to_vec(decoder.forward(z.clone()).unwrap());
    let b = to_vec(decoder.forward(z).unwrap());
    assert_eq!(a, b);
}

#[test]
fn test_forward_checked_matches_forward() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device).unwrap();

    let z = Tensor::<TestBackend, 4>::random([1, 4, 1, 2], Distribution::Default, &device);
    let a = to_vec(decoder.forward(z.clone()).unwrap());
    let b = to_vec(decoder.forward_checked(z).unwrap());
    assert_eq!(a, b);
}

#[test]
fn test_skip_attention_keeps_shape() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device)
        .unwrap()
        .with_skip_attention(true);

    let z = Tensor::<TestBackend, 4>::random([1, 4, 2, 2], Distribution::Default, &device);
    assert_eq!(decoder.forward(z).unwrap().dims(), [1, 3, 16, 16]);
}

#[test]
fn test_decode_to_image_range() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&small_config(), &device)
        .unwrap()
        .with_clamp_overflow(true);

    let z =
        Tensor::<TestBackend, 4>::random([1, 4, 2, 2], Distribution::Normal(0.0, 1.0), &device);
    let img = to_vec(decoder.decode_to_image(z).unwrap());
    assert!(img.iter().all(|v| (0.0..=255.0).contains(v)));
}

#[test]
fn test_plan_round_trips_through_stages() {
    let device = Default::default();
    let config = small_config();
    let decoder = Decoder::<TestBackend>::new(&config, &device).unwrap();

    assert_eq!(decoder.plan(), config.stage_plan());
    assert!(matches!(decoder.stages[0], Stage::Conv(_)));
    assert!(matches!(decoder.stages.last(), Some(Stage::Conv(_))));
}

#[test]
fn test_from_stages_rejects_broken_chain() {
    let device = Default::default();
    let stages = vec![
        Stage::<TestBackend>::new(
            &StageSpec::Conv {
                in_channels: 4,
                out_channels: 64,
                kernel_size: 3,
            },
            &device,
        )
        .unwrap(),
        Stage::new(
            &StageSpec::Residual {
                in_channels: 32,
                out_channels: 32,
            },
            &device,
        )
        .unwrap(),
    ];

    let result = Decoder::from_stages(stages, 4, 32, scaling::SD1X);
    assert!(matches!(result, Err(DecoderError::InvalidConfig(_))));
}

#[test]
fn test_new_rejects_indivisible_config() {
    let device = Default::default();
    let config = DecoderConfig {
        base_channels: 16,
        ..small_config()
    };
    assert!(matches!(
        Decoder::<TestBackend>::new(&config, &device),
        Err(DecoderError::IndivisibleChannels { .. })
    ));
}

/// Full SD 1.x width (~50M parameters); slow on the CPU backend.
#[test]
#[ignore]
fn test_sd1x_forward_shape() {
    let device = Default::default();
    let decoder = Decoder::<TestBackend>::new(&DecoderConfig::sd1x(), &device).unwrap();
    assert_eq!(decoder.stages.len(), 22);

    let z = Tensor::<TestBackend, 4>::random([1, 4, 2, 2], Distribution::Default, &device);
    assert_eq!(decoder.forward(z).unwrap().dims(), [1, 3, 16, 16]);
}
