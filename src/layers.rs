use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::attention::MultiHeadSelfAttention2d;
use crate::config::{Architecture, ModelConfig};

/// Modules whose kernels carry an L2 penalty.
///
/// Only kernels count; biases and normalisation parameters are excluded.
pub trait Regularized<B: Backend> {
    /// Sum of squared kernel weights, shape `[1]`.
    fn squared_weights(&self) -> Tensor<B, 1>;
}

pub(crate) fn squared_norm<B: Backend, const D: usize>(weights: Tensor<B, D>) -> Tensor<B, 1> {
    weights.powf_scalar(2.0).sum()
}

impl<B: Backend> Regularized<B> for Conv2d<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        squared_norm(self.weight.val())
    }
}

impl<B: Backend> Regularized<B> for Linear<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        squared_norm(self.weight.val())
    }
}

/// Half-width attention and half-width convolution over the same input,
/// concatenated along channels.
#[derive(Module, Debug)]
pub struct AugmentedLayer<B: Backend> {
    attention: MultiHeadSelfAttention2d<B>,
    conv: Conv2d<B>,
}

impl<B: Backend> AugmentedLayer<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let attention = self.attention.forward(x.clone());
        let conv = self.conv.forward(x);
        Tensor::cat(vec![attention, conv], 1)
    }
}

/// One architecture layer, chosen once per model by [`Architecture`].
///
/// All variants map `[B, C_in, 8, 8]` to `[B, filter_count, 8, 8]`.
#[derive(Module, Debug)]
pub enum ArchitectureLayer<B: Backend> {
    Conv2d(Conv2d<B>),
    Attention(MultiHeadSelfAttention2d<B>),
    Augmented(AugmentedLayer<B>),
}

impl<B: Backend> ArchitectureLayer<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ArchitectureLayer::Conv2d(conv) => conv.forward(x),
            ArchitectureLayer::Attention(attention) => attention.forward(x),
            ArchitectureLayer::Augmented(augmented) => augmented.forward(x),
        }
    }

    pub fn architecture(&self) -> Architecture {
        match self {
            ArchitectureLayer::Conv2d(_) => Architecture::Conv2d,
            ArchitectureLayer::Attention(_) => Architecture::Attention,
            ArchitectureLayer::Augmented(_) => Architecture::Augmented,
        }
    }
}

impl<B: Backend> Regularized<B> for ArchitectureLayer<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        match self {
            ArchitectureLayer::Conv2d(conv) => conv.squared_weights(),
            ArchitectureLayer::Attention(attention) => attention.squared_weights(),
            ArchitectureLayer::Augmented(augmented) => {
                augmented.attention.squared_weights() + augmented.conv.squared_weights()
            }
        }
    }
}

/// Pre-activation residual unit:
/// `bn -> relu -> layer -> bn -> relu -> layer -> + input`.
///
/// The skip path is the identity, so both layers must output the trunk width.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    bn1: BatchNorm<B, 2>,
    layer1: ArchitectureLayer<B>,
    bn2: BatchNorm<B, 2>,
    layer2: ArchitectureLayer<B>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let skip = x.clone();

        let x = self.bn1.forward(x);
        let x = relu(x);
        let x = self.layer1.forward(x);

        let x = self.bn2.forward(x);
        let x = relu(x);
        let x = self.layer2.forward(x);

        x + skip
    }
}

impl<B: Backend> Regularized<B> for ResidualBlock<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        self.layer1.squared_weights() + self.layer2.squared_weights()
    }
}

/// Constructs layers for one model build and records their names.
///
/// Every layer gets a hierarchical name such as `residual_3/conv2d_1`; names
/// are unique within one build.
pub struct LayerBuilder<'a, B: Backend> {
    device: &'a Device<B>,
    config: &'a ModelConfig,
    names: Vec<String>,
}

impl<'a, B: Backend> LayerBuilder<'a, B> {
    pub fn new(device: &'a Device<B>, config: &'a ModelConfig) -> Self {
        Self {
            device,
            config,
            names: Vec::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        self.config
    }

    pub fn device(&self) -> &Device<B> {
        self.device
    }

    /// Names registered so far, in construction order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }

    fn register(&mut self, name: String) {
        debug_assert!(
            !self.names.contains(&name),
            "layer name {name} registered twice"
        );
        tracing::debug!("Building layer {}", name);
        self.names.push(name);
    }

    /// He-normal initialised convolution with "same" padding.
    pub fn conv2d(
        &mut self,
        name: String,
        channels: [usize; 2],
        kernel_size: usize,
        bias: bool,
    ) -> Conv2d<B> {
        self.register(name);
        Conv2dConfig::new(channels, [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .with_bias(bias)
            .with_initializer(Initializer::KaimingNormal {
                gain: std::f64::consts::SQRT_2,
                fan_out_only: false,
            })
            .init(self.device)
    }

    pub fn batch_norm(&mut self, name: String, channels: usize) -> BatchNorm<B, 2> {
        self.register(name);
        BatchNormConfig::new(channels).init(self.device)
    }

    pub fn dense(&mut self, name: String, d_input: usize, d_output: usize) -> Linear<B> {
        self.register(name);
        LinearConfig::new(d_input, d_output)
            .with_bias(true)
            .init(self.device)
    }

    pub fn self_attention(
        &mut self,
        name: String,
        in_channels: usize,
        total_depth: usize,
    ) -> MultiHeadSelfAttention2d<B> {
        self.register(name);
        MultiHeadSelfAttention2d::new(
            self.device,
            in_channels,
            total_depth,
            self.config.attention_heads,
        )
    }

    /// Builds the configured block strategy, named `{name}`.
    pub fn architecture_layer(&mut self, name: String, in_channels: usize) -> ArchitectureLayer<B> {
        let filters = self.config.filter_count;
        match self.config.architecture {
            Architecture::Conv2d => {
                ArchitectureLayer::Conv2d(self.conv2d(name, [in_channels, filters], 3, false))
            }
            Architecture::Attention => {
                ArchitectureLayer::Attention(self.self_attention(name, in_channels, filters))
            }
            Architecture::Augmented => {
                let attention =
                    self.self_attention(format!("{name}/attention"), in_channels, filters / 2);
                let conv = self.conv2d(
                    format!("{name}/conv2d"),
                    [in_channels, filters - filters / 2],
                    3,
                    false,
                );
                ArchitectureLayer::Augmented(AugmentedLayer { attention, conv })
            }
        }
    }

    pub fn residual_block(&mut self, index: usize) -> ResidualBlock<B> {
        let filters = self.config.filter_count;
        let architecture = self.config.architecture;
        ResidualBlock {
            bn1: self.batch_norm(format!("residual_{index}/batchnorm_0"), filters),
            layer1: self.architecture_layer(format!("residual_{index}/{architecture}_0"), filters),
            bn2: self.batch_norm(format!("residual_{index}/batchnorm_1"), filters),
            layer2: self.architecture_layer(format!("residual_{index}/{architecture}_1"), filters),
        }
    }
}
