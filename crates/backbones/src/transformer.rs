//! Attention and MLP building blocks shared by ViT and Swin.

use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{gelu, softmax};

use crate::init::{Layer, WeightInit};

/// Multi-head self-attention over `(batch, tokens, dim)`.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    qkv: Linear<B>,
    proj: Linear<B>,
    num_heads: usize,
    scale: f64,
}

impl<B: Backend> Attention<B> {
    pub fn new(dim: usize, num_heads: usize, device: &B::Device) -> Self {
        assert!(dim % num_heads == 0, "dim {dim} not divisible by {num_heads} heads");
        Self {
            qkv: LinearConfig::new(dim, dim * 3).init(device),
            proj: LinearConfig::new(dim, dim).init(device),
            num_heads,
            scale: ((dim / num_heads) as f64).powf(-0.5),
        }
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Attend over tokens.
    ///
    /// `bias` and `mask` are added to the pre-softmax scores; each must
    /// broadcast to `(batch, heads, tokens, tokens)` along size-1 axes.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        bias: Option<Tensor<B, 4>>,
        mask: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        let [batch, tokens, dim] = x.dims();
        let heads = self.num_heads;
        let head_dim = dim / heads;

        let qkv = self
            .qkv
            .forward(x)
            .reshape([batch, tokens, 3, heads, head_dim])
            .permute([2, 0, 3, 1, 4]);
        let part = |i: usize| qkv.clone().narrow(0, i, 1).reshape([batch, heads, tokens, head_dim]);
        let (q, k, v) = (part(0), part(1), part(2));

        let mut scores = q.matmul(k.swap_dims(2, 3)).mul_scalar(self.scale);
        if let Some(bias) = bias {
            scores = scores + bias;
        }
        if let Some(mask) = mask {
            scores = scores + mask;
        }
        let attn = softmax(scores, 3);
        let out = attn.matmul(v).swap_dims(1, 2).reshape([batch, tokens, dim]);
        self.proj.forward(out)
    }
}

impl<B: Backend> WeightInit<B> for Attention<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.qkv as &mut dyn WeightInit<B>, &mut self.proj])
    }
}

/// Two-layer GELU MLP.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> Mlp<B> {
    pub fn new(dim: usize, hidden: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(dim, hidden).init(device),
            fc2: LinearConfig::new(hidden, dim).init(device),
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        self.fc2.forward(gelu(self.fc1.forward(x)))
    }
}

impl<B: Backend> WeightInit<B> for Mlp<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.fc1 as &mut dyn WeightInit<B>, &mut self.fc2])
    }
}

/// Pre-norm transformer block: `x + attn(norm(x))`, then `x + mlp(norm(x))`.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(dim: usize, num_heads: usize, mlp_ratio: f64, device: &B::Device) -> Self {
        Self {
            norm1: LayerNormConfig::new(dim).init(device),
            attn: Attention::new(dim, num_heads, device),
            norm2: LayerNormConfig::new(dim).init(device),
            mlp: Mlp::new(dim, (dim as f64 * mlp_ratio) as usize, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn.forward(self.norm1.forward(x), None, None);
        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }
}

impl<B: Backend> WeightInit<B> for TransformerBlock<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.norm1 as &mut dyn WeightInit<B>, &mut self.attn, &mut self.norm2, &mut self.mlp])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_attention_shape() {
        let device = Default::default();
        let attn = Attention::<TestBackend>::new(16, 4, &device);
        let x = Tensor::random([2, 5, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(attn.forward(x, None, None).dims(), [2, 5, 16]);
    }

    #[test]
    fn test_mask_blocks_attention() {
        let device = Default::default();
        let attn = Attention::<TestBackend>::new(8, 2, &device);
        let x = Tensor::<TestBackend, 3>::random([1, 3, 8], Distribution::Normal(0.0, 1.0), &device);

        // Token 0 may only attend to itself, so changing tokens 1..3 must not move it.
        let mut mask = vec![0.0f32; 9];
        mask[1] = -1e9;
        mask[2] = -1e9;
        let mask = Tensor::<TestBackend, 4>::from_data(TensorData::new(mask, [1, 1, 3, 3]), &device);

        let out_a = attn.forward(x.clone(), None, Some(mask.clone()));
        let other = Tensor::cat(
            vec![x.clone().narrow(1, 0, 1), Tensor::random([1, 2, 8], Distribution::Normal(0.0, 1.0), &device)],
            1,
        );
        let out_b = attn.forward(other, None, Some(mask));

        let diff: f32 = (out_a.narrow(1, 0, 1) - out_b.narrow(1, 0, 1))
            .abs()
            .max()
            .into_scalar()
            .elem();
        assert!(diff < 1e-5, "masked token changed by {diff}");
    }

    #[test]
    fn test_block_preserves_shape() {
        let device = Default::default();
        let block = TransformerBlock::<TestBackend>::new(12, 3, 4.0, &device);
        let x = Tensor::random([3, 7, 12], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x).dims(), [3, 7, 12]);
    }
}
