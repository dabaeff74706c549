//! Self-attention over token sequences
//!
//! The decoder's attention block flattens a feature map into `[batch, h*w, c]`
//! tokens and hands them to [`SelfAttention`]. The contract is fixed: the
//! output has the input's shape, positions are not masked, and the result is
//! equivariant to permutations of the sequence.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::error::DecoderError;

/// Scaled dot-product attention over `[batch, heads, seq, head_dim]`
///
/// Queries and keys are each scaled by `head_dim^-0.25`, so the logits carry
/// the usual `head_dim^-0.5` factor.
pub fn qkv_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let [_batch, _heads, _seq_len, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.25);

    let q = q.mul_scalar(scale);
    let k = k.mul_scalar(scale);

    // [batch, heads, seq_q, seq_k]
    let attn = q.matmul(k.transpose());
    let attn = softmax(attn, 3);

    attn.matmul(v)
}

/// Multi-head self-attention with a fused input projection
///
/// `in_proj` maps `C -> 3C` (queries, keys, values concatenated along the
/// feature axis), `out_proj` maps `C -> C`. The decoder uses one head.
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    pub in_proj: Linear<B>,
    pub out_proj: Linear<B>,
    pub num_heads: usize,
    pub embed_dim: usize,
}

impl<B: Backend> SelfAttention<B> {
    /// Creates a new self-attention layer
    ///
    /// Fails when `embed_dim` is not a multiple of `num_heads`.
    pub fn new(
        num_heads: usize,
        embed_dim: usize,
        device: &B::Device,
    ) -> Result<Self, DecoderError> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(DecoderError::InvalidConfig(format!(
                "embed_dim {embed_dim} is not divisible by {num_heads} heads"
            )));
        }

        let in_proj = LinearConfig::new(embed_dim, 3 * embed_dim).init(device);
        let out_proj = LinearConfig::new(embed_dim, embed_dim).init(device);

        Ok(Self {
            in_proj,
            out_proj,
            num_heads,
            embed_dim,
        })
    }

    /// Single-head attention, as used by the decoder's attention block
    pub fn single_head(embed_dim: usize, device: &B::Device) -> Result<Self, DecoderError> {
        Self::new(1, embed_dim, device)
    }

    /// Forward pass
    ///
    /// Input and output: `[batch, seq_len, embed_dim]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, embed_dim] = x.dims();
        let head_dim = embed_dim / self.num_heads;

        // [batch, seq, 3 * embed] holding q | k | v
        let qkv = self.in_proj.forward(x);
        let q = qkv.clone().narrow(2, 0, embed_dim);
        let k = qkv.clone().narrow(2, embed_dim, embed_dim);
        let v = qkv.narrow(2, 2 * embed_dim, embed_dim);

        // [batch, seq, embed] -> [batch, heads, seq, head_dim]
        let split_heads = |t: Tensor<B, 3>| {
            t.reshape([batch, seq_len, self.num_heads, head_dim])
                .swap_dims(1, 2)
        };

        let out = qkv_attention(split_heads(q), split_heads(k), split_heads(v));

        let out = out.swap_dims(1, 2).reshape([batch, seq_len, embed_dim]);
        self.out_proj.forward(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn assert_close(a: Tensor<TestBackend, 3>, b: Tensor<TestBackend, 3>) {
        let a: Vec<f32> = a.into_data().to_vec().unwrap();
        let b: Vec<f32> = b.into_data().to_vec().unwrap();
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(&b).enumerate() {
            assert!((x - y).abs() < 1e-5, "index {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_rejects_uneven_heads() {
        let device = Default::default();
        assert!(SelfAttention::<TestBackend>::new(3, 64, &device).is_err());
        assert!(SelfAttention::<TestBackend>::new(0, 64, &device).is_err());
        assert!(SelfAttention::<TestBackend>::single_head(64, &device).is_ok());
    }

    #[test]
    fn test_self_attention_shape() {
        let device = Default::default();
        let attn = SelfAttention::<TestBackend>::single_head(32, &device).unwrap();
        let x = Tensor::<TestBackend, 3>::random([2, 16, 32], Distribution::Default, &device);
        assert_eq!(attn.forward(x).dims(), [2, 16, 32]);

        let attn = SelfAttention::<TestBackend>::new(4, 32, &device).unwrap();
        let x = Tensor::<TestBackend, 3>::random([1, 9, 32], Distribution::Default, &device);
        assert_eq!(attn.forward(x).dims(), [1, 9, 32]);
    }

    #[test]
    fn test_self_attention_permutation_equivariant() {
        let device = Default::default();
        let attn = SelfAttention::<TestBackend>::single_head(32, &device).unwrap();
        let x = Tensor::<TestBackend, 3>::random([1, 4, 32], Distribution::Default, &device);

        // Reverse the sequence order
        let reversed = x.clone().flip([1]);

        let y = attn.forward(x);
        let y_reversed = attn.forward(reversed).flip([1]);

        assert_close(y, y_reversed);
    }

    #[test]
    fn test_qkv_attention_uniform_keys_average_values() {
        let device = Default::default();
        // Identical keys give uniform weights, so every output is the mean of v
        let q = Tensor::<TestBackend, 4>::random([1, 1, 3, 4], Distribution::Default, &device);
        let k = Tensor::<TestBackend, 4>::ones([1, 1, 3, 4], &device);
        let v = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.0, 0.0, 0.0, 0.0], [3.0, 3.0, 3.0, 3.0], [6.0, 6.0, 6.0, 6.0]]]],
            &device,
        );

        let out: Vec<f32> = qkv_attention(q, k, v).into_data().to_vec().unwrap();
        assert_eq!(out.len(), 12);
        assert!(out.iter().all(|x| (x - 3.0).abs() < 1e-5));
    }
}
