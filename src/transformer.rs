use burn::nn::attention::generate_autoregressive_mask;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
    LinearConfig,
};
use burn::prelude::*;
use burn::tensor::activation::{log_softmax, relu, softmax};

use crate::config::CommentaryConfig;
use crate::tokenizer::{END_ID, PAD_ID, START_ID};

const MASKED_SCORE: f32 = -1.0e9;

/// Multi-head attention with an optional blocking mask.
///
/// `mask` is `[batch, query_len, key_len]`; `true` entries get no weight.
#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    num_heads: usize,
    head_dim: usize,
    q_proj: Linear<B>,
    k_proj: Linear<B>,
    v_proj: Linear<B>,
    o_proj: Linear<B>,
}

impl<B: Backend> MultiHeadAttention<B> {
    /// # Panics
    ///
    /// If `d_model` is not a nonzero multiple of `num_heads`.
    pub(crate) fn new(device: &Device<B>, d_model: usize, num_heads: usize) -> Self {
        assert!(
            num_heads > 0 && d_model > 0 && d_model % num_heads == 0,
            "model width {d_model} must be divisible by {num_heads} heads"
        );
        Self {
            num_heads,
            head_dim: d_model / num_heads,
            q_proj: LinearConfig::new(d_model, d_model).init(device),
            k_proj: LinearConfig::new(d_model, d_model).init(device),
            v_proj: LinearConfig::new(d_model, d_model).init(device),
            o_proj: LinearConfig::new(d_model, d_model).init(device),
        }
    }

    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        context: Tensor<B, 3>,
        mask: Option<Tensor<B, 3, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch, query_len, d_model] = query.dims();
        let [_, key_len, _] = context.dims();

        let split = |t: Tensor<B, 3>, len: usize| {
            t.reshape([batch, len, self.num_heads, self.head_dim])
                .swap_dims(1, 2)
        };
        let q = split(self.q_proj.forward(query), query_len);
        let k = split(self.k_proj.forward(context.clone()), key_len);
        let v = split(self.v_proj.forward(context), key_len);

        let scale = (self.head_dim as f32).sqrt();
        let mut scores = q.matmul(k.swap_dims(2, 3)).div_scalar(scale); // [B, H, Q, K]
        if let Some(mask) = mask {
            let mask = mask
                .reshape([batch, 1, query_len, key_len])
                .repeat_dim(1, self.num_heads);
            scores = scores.mask_fill(mask, MASKED_SCORE);
        }
        let weights = softmax(scores, 3);

        let context = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, query_len, d_model]);
        self.o_proj.forward(context)
    }
}

/// Two-layer position-wise feed-forward network.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(device: &Device<B>, d_model: usize, d_feedforward: usize) -> Self {
        Self {
            fc1: LinearConfig::new(d_model, d_feedforward).init(device),
            fc2: LinearConfig::new(d_feedforward, d_model).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(relu(self.fc1.forward(x)))
    }
}

fn layer_norm<B: Backend>(device: &Device<B>, d_model: usize) -> LayerNorm<B> {
    LayerNormConfig::new(d_model)
        .with_epsilon(1e-6)
        .init(device)
}

#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    attention: MultiHeadAttention<B>,
    feed_forward: FeedForward<B>,
    norm1: LayerNorm<B>,
    norm2: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> EncoderLayer<B> {
    pub fn new(device: &Device<B>, config: &CommentaryConfig) -> Self {
        let d_model = config.transformer_filters;
        Self {
            attention: MultiHeadAttention::new(device, d_model, config.transformer_heads),
            feed_forward: FeedForward::new(device, d_model, config.transformer_feedforward),
            norm1: layer_norm(device, d_model),
            norm2: layer_norm(device, d_model),
            dropout: DropoutConfig::new(config.transformer_dropout_rate).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 3, Bool>>) -> Tensor<B, 3> {
        let attention = self.attention.forward(x.clone(), x.clone(), mask);
        let x = self.norm1.forward(x + self.dropout.forward(attention));

        let feed_forward = self.feed_forward.forward(x.clone());
        self.norm2.forward(x + self.dropout.forward(feed_forward))
    }
}

#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    self_attention: MultiHeadAttention<B>,
    cross_attention: MultiHeadAttention<B>,
    feed_forward: FeedForward<B>,
    norm1: LayerNorm<B>,
    norm2: LayerNorm<B>,
    norm3: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> DecoderLayer<B> {
    pub fn new(device: &Device<B>, config: &CommentaryConfig) -> Self {
        let d_model = config.transformer_filters;
        let heads = config.transformer_heads;
        Self {
            self_attention: MultiHeadAttention::new(device, d_model, heads),
            cross_attention: MultiHeadAttention::new(device, d_model, heads),
            feed_forward: FeedForward::new(device, d_model, config.transformer_feedforward),
            norm1: layer_norm(device, d_model),
            norm2: layer_norm(device, d_model),
            norm3: layer_norm(device, d_model),
            dropout: DropoutConfig::new(config.transformer_dropout_rate).init(),
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        encoded: Tensor<B, 3>,
        self_mask: Tensor<B, 3, Bool>,
        cross_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Tensor<B, 3> {
        let attention = self
            .self_attention
            .forward(x.clone(), x.clone(), Some(self_mask));
        let x = self.norm1.forward(x + self.dropout.forward(attention));

        let attention = self.cross_attention.forward(x.clone(), encoded, cross_mask);
        let x = self.norm2.forward(x + self.dropout.forward(attention));

        let feed_forward = self.feed_forward.forward(x.clone());
        self.norm3.forward(x + self.dropout.forward(feed_forward))
    }
}

/// Blocks attention to `<pad>` keys: `[batch, key_len]` -> `[batch, query_len, key_len]`.
pub fn padding_mask<B: Backend>(
    tokens: &Tensor<B, 2, Int>,
    query_len: usize,
) -> Tensor<B, 3, Bool> {
    let [batch, key_len] = tokens.dims();
    tokens
        .clone()
        .equal_elem(PAD_ID as i64)
        .reshape([batch, 1, key_len])
        .repeat_dim(1, query_len)
}

/// Causal mask combined with the padding mask of the decoder's own tokens.
pub fn look_ahead_mask<B: Backend>(tokens: &Tensor<B, 2, Int>) -> Tensor<B, 3, Bool> {
    let [batch, seq_len] = tokens.dims();
    let causal = generate_autoregressive_mask::<B>(batch, seq_len, &tokens.device());
    let padding = padding_mask(tokens, seq_len);
    causal.int().add(padding.int()).greater_elem(0)
}

/// Sinusoidal position encoding, `[seq_len, d_model]`.
pub fn positional_encoding<B: Backend>(
    seq_len: usize,
    d_model: usize,
    device: &Device<B>,
) -> Tensor<B, 2> {
    let values: Vec<f32> = (0..seq_len)
        .flat_map(|position| {
            (0..d_model).map(move |i| {
                let rate = 1.0 / 10000f32.powf((2 * (i / 2)) as f32 / d_model as f32);
                let angle = position as f32 * rate;
                if i % 2 == 0 {
                    angle.sin()
                } else {
                    angle.cos()
                }
            })
        })
        .collect();
    Tensor::from_data(TensorData::new(values, [seq_len, d_model]), device)
}

/// Encoder-decoder transformer that turns a board encoding into comment tokens.
///
/// The encoder consumes the 64 square tokens as they are; square order is
/// already meaningful, so only the decoder adds position encodings.
#[derive(Module, Debug)]
pub struct CommentaryTransformer<B: Backend> {
    encoder_layers: Vec<EncoderLayer<B>>,
    embedding: Embedding<B>,
    decoder_layers: Vec<DecoderLayer<B>>,
    output: Linear<B>,
    dropout: Dropout,
    d_model: usize,
    vocab_size: usize,
    max_length: usize,
}

impl<B: Backend> CommentaryTransformer<B> {
    pub fn new(device: &Device<B>, config: &CommentaryConfig, vocab_size: usize) -> Self {
        let d_model = config.transformer_filters;
        tracing::info!(
            "Building commentary transformer: layers={}, d_model={}, heads={}, vocab={}",
            config.transformer_layers,
            d_model,
            config.transformer_heads,
            vocab_size
        );

        Self {
            encoder_layers: (0..config.transformer_layers)
                .map(|_| EncoderLayer::new(device, config))
                .collect(),
            embedding: EmbeddingConfig::new(vocab_size, d_model).init(device),
            decoder_layers: (0..config.transformer_layers)
                .map(|_| DecoderLayer::new(device, config))
                .collect(),
            output: LinearConfig::new(d_model, vocab_size).init(device),
            dropout: DropoutConfig::new(config.transformer_dropout_rate).init(),
            d_model,
            vocab_size,
            max_length: config.transformer_max_length,
        }
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Encodes `[batch, 64, d_model]` board tokens.
    ///
    /// `padding` (`true` = padded position, `[batch, seq_len]`) is only needed
    /// for variable-length encoder input.
    pub fn encode(
        &self,
        board: Tensor<B, 3>,
        padding: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch, seq_len, d_model] = board.dims();
        assert_eq!(d_model, self.d_model, "encoder input width mismatch");

        let mask = padding.map(|padding| {
            padding
                .reshape([batch, 1, seq_len])
                .repeat_dim(1, seq_len)
        });
        let mut x = self.dropout.forward(board);
        for layer in &self.encoder_layers {
            x = layer.forward(x, mask.clone());
        }
        x
    }

    /// Token logits `[batch, seq_len, vocab_size]` for each decoder position.
    pub fn decode(
        &self,
        tokens: Tensor<B, 2, Int>,
        encoded: Tensor<B, 3>,
        encoder_padding: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch, seq_len] = tokens.dims();
        let [_, encoded_len, _] = encoded.dims();
        assert!(
            seq_len <= self.max_length,
            "decoder input of {seq_len} tokens exceeds max length {}",
            self.max_length
        );
        let device = tokens.device();

        let self_mask = look_ahead_mask(&tokens);
        let cross_mask = encoder_padding.map(|padding| {
            padding
                .reshape([batch, 1, encoded_len])
                .repeat_dim(1, seq_len)
        });

        let x = self.embedding
            .forward(tokens)
            .mul_scalar((self.d_model as f32).sqrt());
        let positions =
            positional_encoding::<B>(seq_len, self.d_model, &device).unsqueeze::<3>();
        let mut x = self.dropout.forward(x + positions);

        for layer in &self.decoder_layers {
            x = layer.forward(x, encoded.clone(), self_mask.clone(), cross_mask.clone());
        }
        self.output.forward(x)
    }

    /// Teacher-forced logits: `tokens` starts with `<start>`.
    pub fn forward(&self, board: Tensor<B, 3>, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let encoded = self.encode(board, None);
        self.decode(tokens, encoded, None)
    }

    /// Greedy decoding from `<start>` until every sequence emits `<end>` or
    /// `max_length` tokens exist. Returned ids exclude `<start>`.
    pub fn generate(&self, board: Tensor<B, 3>) -> Vec<Vec<usize>> {
        let [batch, _, _] = board.dims();
        if batch == 0 {
            return Vec::new();
        }
        let device = board.device();
        let encoded = self.encode(board, None);

        let mut sequences: Vec<Vec<usize>> = vec![vec![START_ID]; batch];
        let mut finished = vec![false; batch];

        // Every row grows by one token per step.
        let mut seq_len = 1;
        while seq_len < self.max_length && finished.iter().any(|done| !done) {
            let flat: Vec<i64> = sequences
                .iter()
                .flat_map(|sequence| sequence.iter().map(|&id| id as i64))
                .collect();
            let tokens = Tensor::<B, 1, Int>::from_data(
                TensorData::new(flat, [batch * seq_len]),
                &device,
            )
            .reshape([batch, seq_len]);

            let logits = self.decode(tokens, encoded.clone(), None);
            let next = logits
                .slice([0..batch, seq_len - 1..seq_len, 0..self.vocab_size])
                .argmax(2)
                .reshape([batch]);

            for (index, id) in next.into_data().iter::<i64>().enumerate() {
                // Finished rows keep padding so every row stays the same length.
                let id = if finished[index] { PAD_ID } else { id as usize };
                finished[index] |= id == END_ID;
                sequences[index].push(id);
            }
            seq_len += 1;
        }

        sequences
            .into_iter()
            .map(|mut sequence| {
                sequence.remove(0);
                sequence
            })
            .collect()
    }
}

/// Mean token cross-entropy over non-`<pad>` targets.
pub fn masked_cross_entropy<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
) -> Tensor<B, 1> {
    let [batch, seq_len, vocab_size] = logits.dims();
    let log_probs = log_softmax(logits, 2).reshape([batch * seq_len, vocab_size]);
    let targets = targets.reshape([batch * seq_len, 1]);

    let keep = targets
        .clone()
        .not_equal_elem(PAD_ID as i64)
        .float()
        .reshape([batch * seq_len]);
    let token_loss = log_probs.gather(1, targets).reshape([batch * seq_len]).neg();

    let total = (token_loss * keep.clone()).sum();
    total / keep.sum().clamp_min(1.0)
}
