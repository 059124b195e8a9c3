use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::softmax;
use burn::tensor::{backend::Backend, Device, Tensor};

use crate::layers::{squared_norm, Regularized};

/// Multi-head self-attention over the squares of a channel-first board.
///
/// Every square is one sequence element. The channel dimension is projected
/// to `total_depth`, split into `num_heads` heads, attended independently,
/// merged and projected back to `total_depth` channels. Spatial extent is
/// preserved.
#[derive(Module, Debug)]
pub struct MultiHeadSelfAttention2d<B: Backend> {
    num_heads: usize,
    head_dim: usize,
    q_proj: Linear<B>,
    k_proj: Linear<B>,
    v_proj: Linear<B>,
    o_proj: Linear<B>,
}

impl<B: Backend> MultiHeadSelfAttention2d<B> {
    /// # Panics
    ///
    /// If `total_depth` is not a nonzero multiple of `num_heads`.
    pub(crate) fn new(
        device: &Device<B>,
        in_channels: usize,
        total_depth: usize,
        num_heads: usize,
    ) -> Self {
        assert!(
            num_heads > 0 && total_depth > 0 && total_depth % num_heads == 0,
            "attention depth {total_depth} must be divisible by {num_heads} heads"
        );

        let projection = |d_input| {
            LinearConfig::new(d_input, total_depth)
                .with_bias(false)
                .init(device)
        };

        Self {
            num_heads,
            head_dim: total_depth / num_heads,
            q_proj: projection(in_channels),
            k_proj: projection(in_channels),
            v_proj: projection(in_channels),
            o_proj: projection(total_depth),
        }
    }

    pub fn total_depth(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let seq_len = height * width;
        let depth = self.total_depth();

        // [B, C, H, W] -> [B, S, C]
        let x = x.reshape([batch, channels, seq_len]).swap_dims(1, 2);

        // Reshape to [B, H, S, D]
        let split = |t: Tensor<B, 3>| {
            t.reshape([batch, seq_len, self.num_heads, self.head_dim])
                .swap_dims(1, 2)
        };
        let q = split(self.q_proj.forward(x.clone()));
        let k = split(self.k_proj.forward(x.clone()));
        let v = split(self.v_proj.forward(x));

        let scale = (self.head_dim as f32).sqrt();
        let scores = q.matmul(k.swap_dims(2, 3)).div_scalar(scale); // [B, H, S, S]
        let weights = softmax(scores, 3);
        let context = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, seq_len, depth]);

        // [B, S, D] -> [B, D, H, W]
        self.o_proj
            .forward(context)
            .swap_dims(1, 2)
            .reshape([batch, depth, height, width])
    }
}

impl<B: Backend> Regularized<B> for MultiHeadSelfAttention2d<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        squared_norm(self.q_proj.weight.val())
            + squared_norm(self.k_proj.weight.val())
            + squared_norm(self.v_proj.weight.val())
            + squared_norm(self.o_proj.weight.val())
    }
}
