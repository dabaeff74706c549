//! Latent to RGB image, through the public re-exports.

use burn::prelude::*;

use latent_decoder::backends::{DefaultBackend, default_device};
use latent_decoder::samplers::init_noise_latent;
use latent_decoder::{
    ChannelLayout, Decoder, DecoderConfig, export_decoder, load_decoder, move_channel, to_rgb8,
};

fn small_config() -> DecoderConfig {
    DecoderConfig {
        base_channels: 32,
        channel_mult: vec![1, 1, 2, 2],
        num_res_blocks: 1,
        ..DecoderConfig::sd1x()
    }
}

#[test]
fn test_latent_to_rgb_images() {
    let device = default_device();
    let decoder = Decoder::<DefaultBackend>::new(&small_config(), &device).unwrap();

    let latents = init_noise_latent::<DefaultBackend>([2, 4, 2, 3], 1.0, &device);
    let decoded = decoder.forward(latents).unwrap();
    assert_eq!(decoded.dims(), [2, 3, 16, 24]);

    let images = to_rgb8(decoded).unwrap();
    assert_eq!(images.len(), 2);
    for image in &images {
        assert_eq!(image.dimensions(), (24, 16));
    }
}

#[test]
fn test_channel_last_view_of_decoded_batch() {
    let device = default_device();
    let decoder = Decoder::<DefaultBackend>::new(&small_config(), &device).unwrap();

    let latents = init_noise_latent::<DefaultBackend>([1, 4, 1, 1], 1.0, &device);
    let decoded = decoder.forward(latents).unwrap();

    let hwc = move_channel(decoded.clone(), ChannelLayout::Last);
    assert_eq!(hwc.dims(), [1, 8, 8, 3]);

    let chw: Vec<f32> = move_channel(hwc, ChannelLayout::First)
        .into_data()
        .to_vec()
        .unwrap();
    let original: Vec<f32> = decoded.into_data().to_vec().unwrap();
    assert_eq!(chw, original);
}

#[test]
fn test_reloaded_decoder_renders_same_images() {
    let device = default_device();
    let config = small_config();
    let decoder = Decoder::<DefaultBackend>::new(&config, &device).unwrap();
    let reloaded =
        load_decoder::<DefaultBackend>(&export_decoder(&decoder).unwrap(), &config, &device)
            .unwrap();

    let latents = init_noise_latent::<DefaultBackend>([1, 4, 2, 2], 1.0, &device);
    let a = to_rgb8(decoder.forward(latents.clone()).unwrap()).unwrap();
    let b = to_rgb8(reloaded.forward(latents).unwrap()).unwrap();
    assert_eq!(a, b);
}
