//! Decoder weight loading and export
//!
//! Parameters are named after the reference network, a flat sequence of 26
//! layers for SD 1.x:
//!
//! | Stage                | Names                                                      |
//! |----------------------|------------------------------------------------------------|
//! | conv                 | `layers.{i}.weight`, `layers.{i}.bias`                     |
//! | upsample             | `layers.{i+1}.*` (the resize at `i` has no parameters)     |
//! | residual             | `layers.{i}.group_norm_1.*`, `conv_1`, `group_norm_2`, `conv_2`, `residual_layer` |
//! | attention            | `layers.{i}.group_norm.*`, `attention.in_proj.*`, `attention.out_proj.*` |
//! | norm + activation    | `layers.{i}.weight`, `layers.{i}.bias` (SiLU at `i+1`)     |
//!
//! Linear weights are stored `[out_features, in_features]`.

use std::collections::BTreeSet;

use burn::module::Param;
use burn::nn::Linear;
use burn::nn::conv::Conv2d;
use burn::prelude::*;

use latent_decoder_core::attention::SelfAttention;
use latent_decoder_core::groupnorm::GroupNorm;
use latent_decoder_vae::{
    AttentionBlock, Decoder, DecoderConfig, ResidualBlock, Stage, StageSpec,
};

use crate::params::{LoadError, ParamStore};

/// Reference layer index of every stage in `plan`
///
/// A plan without the leading 1x1 post-quant conv starts at index 1, so
/// names stay aligned with the full network.
pub fn layer_indices(plan: &[StageSpec]) -> Vec<usize> {
    let mut index = match plan.first() {
        Some(StageSpec::Conv { kernel_size: 1, .. }) => 0,
        _ => 1,
    };

    plan.iter()
        .map(|spec| {
            let at = index;
            index += spec.reference_layers();
            at
        })
        .collect()
}

/// Tensor-name prefixes for every stage in `plan`
pub fn stage_prefixes(plan: &[StageSpec]) -> Vec<String> {
    plan.iter()
        .zip(layer_indices(plan))
        .map(|(spec, index)| match spec {
            StageSpec::Upsample { .. } => format!("layers.{}", index + 1),
            _ => format!("layers.{index}"),
        })
        .collect()
}

/// Loads parameters out of a store, recording which names were used
struct StoreReader<'a, B: Backend> {
    store: &'a ParamStore,
    device: &'a B::Device,
    consumed: BTreeSet<String>,
}

impl<'a, B: Backend> StoreReader<'a, B> {
    fn new(store: &'a ParamStore, device: &'a B::Device) -> Self {
        Self {
            store,
            device,
            consumed: BTreeSet::new(),
        }
    }

    fn tensor<const D: usize>(
        &mut self,
        name: String,
        expected: [usize; D],
    ) -> Result<Tensor<B, D>, LoadError> {
        let tensor = self.store.tensor(&name, expected, self.device)?;
        self.consumed.insert(name);
        Ok(tensor)
    }

    fn conv2d(&mut self, prefix: &str, conv: &mut Conv2d<B>) -> Result<(), LoadError> {
        let weight = self.tensor(format!("{prefix}.weight"), conv.weight.val().dims())?;
        conv.weight = Param::from_tensor(weight);

        if let Some(bias) = &conv.bias {
            let bias = self.tensor(format!("{prefix}.bias"), bias.val().dims())?;
            conv.bias = Some(Param::from_tensor(bias));
        }
        Ok(())
    }

    fn linear(&mut self, prefix: &str, linear: &mut Linear<B>) -> Result<(), LoadError> {
        // Burn stores [in, out]; the reference layout is [out, in]
        let [d_in, d_out] = linear.weight.val().dims();
        let weight: Tensor<B, 2> = self.tensor(format!("{prefix}.weight"), [d_out, d_in])?;
        linear.weight = Param::from_tensor(weight.transpose());

        if linear.bias.is_some() {
            let bias = self.tensor(format!("{prefix}.bias"), [d_out])?;
            linear.bias = Some(Param::from_tensor(bias));
        }
        Ok(())
    }

    fn group_norm(&mut self, prefix: &str, norm: &mut GroupNorm<B>) -> Result<(), LoadError> {
        let channels = norm.num_channels();
        let weight = self.tensor(format!("{prefix}.weight"), [channels])?;
        let bias = self.tensor(format!("{prefix}.bias"), [channels])?;
        norm.weight = Param::from_tensor(weight);
        norm.bias = Param::from_tensor(bias);
        Ok(())
    }

    fn residual(&mut self, prefix: &str, block: &mut ResidualBlock<B>) -> Result<(), LoadError> {
        self.group_norm(&format!("{prefix}.group_norm_1"), &mut block.norm1.norm)?;
        self.conv2d(&format!("{prefix}.conv_1"), &mut block.conv1)?;
        self.group_norm(&format!("{prefix}.group_norm_2"), &mut block.norm2.norm)?;
        self.conv2d(&format!("{prefix}.conv_2"), &mut block.conv2)?;
        if let Some(skip) = &mut block.skip_conv {
            self.conv2d(&format!("{prefix}.residual_layer"), skip)?;
        }
        Ok(())
    }

    fn attention(&mut self, prefix: &str, block: &mut AttentionBlock<B>) -> Result<(), LoadError> {
        self.group_norm(&format!("{prefix}.group_norm"), &mut block.norm)?;
        self.self_attention(&format!("{prefix}.attention"), &mut block.attention)
    }

    fn self_attention(
        &mut self,
        prefix: &str,
        attention: &mut SelfAttention<B>,
    ) -> Result<(), LoadError> {
        self.linear(&format!("{prefix}.in_proj"), &mut attention.in_proj)?;
        self.linear(&format!("{prefix}.out_proj"), &mut attention.out_proj)
    }

    fn stage(&mut self, prefix: &str, stage: &mut Stage<B>) -> Result<(), LoadError> {
        match stage {
            Stage::Conv(conv) => self.conv2d(prefix, conv),
            Stage::Residual(block) => self.residual(prefix, block),
            Stage::Attention(block) => self.attention(prefix, block),
            Stage::Upsample(up) => self.conv2d(prefix, &mut up.conv),
            Stage::NormActivation(unit) => self.group_norm(prefix, &mut unit.norm),
        }
    }
}

/// Builds a decoder for `config` and fills every parameter from `store`
///
/// Every expected tensor must be present with exactly the shape the stage
/// declares. Names the decoder does not use are logged and ignored.
pub fn load_decoder<B: Backend>(
    store: &ParamStore,
    config: &DecoderConfig,
    device: &B::Device,
) -> Result<Decoder<B>, LoadError> {
    let mut decoder = Decoder::new(config, device)?;
    let prefixes = stage_prefixes(&decoder.plan());

    let mut reader = StoreReader::<B>::new(store, device);
    for (stage, prefix) in decoder.stages.iter_mut().zip(&prefixes) {
        log::debug!("loading {} from {prefix}", stage.spec());
        reader.stage(prefix, stage)?;
    }

    let unused: Vec<&str> = store
        .names()
        .filter(|name| !reader.consumed.contains(*name))
        .collect();
    if !unused.is_empty() {
        log::warn!(
            "{} tensors not used by the decoder (first: {})",
            unused.len(),
            unused[0]
        );
    }

    log::info!(
        "Loaded decoder: {} stages, {} tensors",
        decoder.stages.len(),
        reader.consumed.len()
    );

    Ok(decoder)
}

/// Writes stage parameters into a store
struct StoreWriter {
    store: ParamStore,
}

impl StoreWriter {
    fn conv2d<B: Backend>(&mut self, prefix: &str, conv: &Conv2d<B>) -> Result<(), LoadError> {
        self.store
            .insert_tensor(format!("{prefix}.weight"), conv.weight.val())?;
        if let Some(bias) = &conv.bias {
            self.store.insert_tensor(format!("{prefix}.bias"), bias.val())?;
        }
        Ok(())
    }

    fn linear<B: Backend>(&mut self, prefix: &str, linear: &Linear<B>) -> Result<(), LoadError> {
        self.store
            .insert_tensor(format!("{prefix}.weight"), linear.weight.val().transpose())?;
        if let Some(bias) = &linear.bias {
            self.store.insert_tensor(format!("{prefix}.bias"), bias.val())?;
        }
        Ok(())
    }

    fn group_norm<B: Backend>(&mut self, prefix: &str, norm: &GroupNorm<B>) -> Result<(), LoadError> {
        self.store
            .insert_tensor(format!("{prefix}.weight"), norm.weight.val())?;
        self.store
            .insert_tensor(format!("{prefix}.bias"), norm.bias.val())
    }

    fn stage<B: Backend>(&mut self, prefix: &str, stage: &Stage<B>) -> Result<(), LoadError> {
        match stage {
            Stage::Conv(conv) => self.conv2d(prefix, conv),
            Stage::Residual(block) => {
                self.group_norm(&format!("{prefix}.group_norm_1"), &block.norm1.norm)?;
                self.conv2d(&format!("{prefix}.conv_1"), &block.conv1)?;
                self.group_norm(&format!("{prefix}.group_norm_2"), &block.norm2.norm)?;
                self.conv2d(&format!("{prefix}.conv_2"), &block.conv2)?;
                match &block.skip_conv {
                    Some(skip) => self.conv2d(&format!("{prefix}.residual_layer"), skip),
                    None => Ok(()),
                }
            }
            Stage::Attention(block) => {
                self.group_norm(&format!("{prefix}.group_norm"), &block.norm)?;
                self.linear(&format!("{prefix}.attention.in_proj"), &block.attention.in_proj)?;
                self.linear(&format!("{prefix}.attention.out_proj"), &block.attention.out_proj)
            }
            Stage::Upsample(up) => self.conv2d(prefix, &up.conv),
            Stage::NormActivation(unit) => self.group_norm(prefix, &unit.norm),
        }
    }
}

/// Copies every decoder parameter into a store under its reference name
pub fn export_decoder<B: Backend>(decoder: &Decoder<B>) -> Result<ParamStore, LoadError> {
    let prefixes = stage_prefixes(&decoder.plan());

    let mut writer = StoreWriter {
        store: ParamStore::new(),
    };
    for (stage, prefix) in decoder.stages.iter().zip(&prefixes) {
        writer.stage(prefix, stage)?;
    }

    log::debug!(
        "exported {} tensors ({} parameters)",
        writer.store.len(),
        writer.store.num_params()
    );

    Ok(writer.store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd1x_layer_indices() {
        let plan = DecoderConfig::sd1x().stage_plan();
        let indices = layer_indices(&plan);

        // conv, conv, res, attn, res x4, up(8,9), res x3, up(13,14), ...
        assert_eq!(
            indices,
            vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13, 15, 16, 17, 18, 20, 21, 22, 23, 25]
        );

        let prefixes = stage_prefixes(&plan);
        assert_eq!(prefixes[8], "layers.9");
        assert_eq!(prefixes[20], "layers.23");
        assert_eq!(prefixes[21], "layers.25");
    }

    #[test]
    fn test_indices_without_post_quant_conv() {
        let config = DecoderConfig {
            post_quant_conv: false,
            ..DecoderConfig::sd1x()
        };
        let indices = layer_indices(&config.stage_plan());
        assert_eq!(indices[0], 1);
        assert_eq!(*indices.last().unwrap(), 25);
    }
}
