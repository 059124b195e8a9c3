use burn::nn::{conv::Conv2d, BatchNorm, Linear};
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::config::{DataFormat, ModelConfig, BOARD_SIDE, BOARD_SQUARES};
use crate::error::ModelError;
use crate::layers::{ArchitectureLayer, LayerBuilder, Regularized, ResidualBlock};

/// Name of the model's single input.
pub const INPUT_NAME: &str = "Input";

/// Outputs of the composed model, in their stable positional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputName {
    Value,
    MctsValue,
    Policy,
    ReplyPolicy,
    CommentaryEncoder,
}

impl OutputName {
    /// Positional contract consumed by serving code.
    pub const ALL: [OutputName; 5] = [
        OutputName::Value,
        OutputName::MctsValue,
        OutputName::Policy,
        OutputName::ReplyPolicy,
        OutputName::CommentaryEncoder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputName::Value => "OutputValue",
            OutputName::MctsValue => "OutputMctsValue",
            OutputName::Policy => "OutputPolicy",
            OutputName::ReplyPolicy => "OutputReplyPolicy",
            OutputName::CommentaryEncoder => "OutputCommentaryEncoder",
        }
    }
}

/// A single named output; ranks differ per head.
#[derive(Debug, Clone)]
pub enum HeadOutput<B: Backend> {
    /// `[batch, 1]` in `[-1, 1]`.
    Value(Tensor<B, 2>),
    /// `[batch, output_planes_count, 8, 8]` logits (layout-dependent).
    Policy(Tensor<B, 4>),
    /// `[batch, 64, filter_count]`.
    Sequence(Tensor<B, 3>),
}

impl<B: Backend> HeadOutput<B> {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            HeadOutput::Value(t) => t.dims().to_vec(),
            HeadOutput::Policy(t) => t.dims().to_vec(),
            HeadOutput::Sequence(t) => t.dims().to_vec(),
        }
    }
}

/// The four gameplay outputs.
#[derive(Debug, Clone)]
pub struct PlayOutput<B: Backend> {
    pub value: Tensor<B, 2>,
    pub mcts_value: Tensor<B, 2>,
    pub policy: Tensor<B, 4>,
    pub reply_policy: Tensor<B, 4>,
}

impl<B: Backend> PlayOutput<B> {
    pub fn into_named(self) -> Vec<(OutputName, HeadOutput<B>)> {
        vec![
            (OutputName::Value, HeadOutput::Value(self.value)),
            (OutputName::MctsValue, HeadOutput::Value(self.mcts_value)),
            (OutputName::Policy, HeadOutput::Policy(self.policy)),
            (OutputName::ReplyPolicy, HeadOutput::Policy(self.reply_policy)),
        ]
    }
}

/// Every output of the composed model.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    pub play: PlayOutput<B>,
    pub commentary_encoder: Tensor<B, 3>,
}

impl<B: Backend> ModelOutput<B> {
    /// Outputs in [`OutputName::ALL`] order.
    pub fn into_named(self) -> Vec<(OutputName, HeadOutput<B>)> {
        let mut outputs = self.play.into_named();
        outputs.push((
            OutputName::CommentaryEncoder,
            HeadOutput::Sequence(self.commentary_encoder),
        ));
        outputs
    }
}

/// Convolutional stem followed by the residual tower.
#[derive(Module, Debug)]
pub struct Trunk<B: Backend> {
    input_conv: Conv2d<B>,
    input_bn: BatchNorm<B, 2>,
    blocks: Vec<ResidualBlock<B>>,
    tower_bn: BatchNorm<B, 2>,
    filter_count: usize,
}

impl<B: Backend> Trunk<B> {
    pub fn new(builder: &mut LayerBuilder<'_, B>) -> Self {
        let config = builder.config().clone();
        let filters = config.filter_count;

        // The stem is convolutional whatever the architecture.
        let input_conv = builder.conv2d(
            format!("initial/conv2d_{filters}"),
            [config.input_planes_count, filters],
            3,
            false,
        );
        let input_bn = builder.batch_norm("initial/batchnorm".to_string(), filters);

        let blocks = (0..config.residual_count)
            .map(|index| builder.residual_block(index))
            .collect();

        let tower_bn = builder.batch_norm("tower/batchnorm".to_string(), filters);

        Self {
            input_conv,
            input_bn,
            blocks,
            tower_bn,
            filter_count: filters,
        }
    }

    pub fn output_channels(&self) -> usize {
        self.filter_count
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.input_conv.forward(x);
        let x = self.input_bn.forward(x);
        let mut x = relu(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = self.tower_bn.forward(x);
        relu(x)
    }
}

impl<B: Backend> Regularized<B> for Trunk<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        self.blocks
            .iter()
            .fold(self.input_conv.squared_weights(), |acc, block| {
                acc + block.squared_weights()
            })
    }
}

/// Scalar evaluation head; bounded to `[-1, 1]` by tanh.
#[derive(Module, Debug)]
pub struct ValueHead<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    hidden: Linear<B>,
    output: Linear<B>,
}

impl<B: Backend> ValueHead<B> {
    pub fn new(builder: &mut LayerBuilder<'_, B>, name: &str, in_channels: usize) -> Self {
        let dense_count = builder.config().dense_count;
        let value_filter_count = 1;

        let conv = builder.conv2d(
            format!("{name}/conv2d_{value_filter_count}"),
            [in_channels, value_filter_count],
            1,
            false,
        );
        let bn = builder.batch_norm(format!("{name}/batchnorm"), value_filter_count);
        // Biases on the dense layers: no normalisation follows them.
        let hidden = builder.dense(
            format!("{name}/dense_{dense_count}"),
            value_filter_count * BOARD_SQUARES,
            dense_count,
        );
        let output = builder.dense(format!("{name}/dense_1"), dense_count, 1);

        Self {
            conv,
            bn,
            hidden,
            output,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = x.dims();

        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = relu(x);
        let x = x.reshape([batch, BOARD_SQUARES]);

        let x = relu(self.hidden.forward(x));
        self.output.forward(x).tanh()
    }
}

impl<B: Backend> Regularized<B> for ValueHead<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        self.conv.squared_weights() + self.hidden.squared_weights() + self.output.squared_weights()
    }
}

/// Spatial move-policy head; keeps the full 8x8 extent.
#[derive(Module, Debug)]
pub struct PolicyHead<B: Backend> {
    layer: ArchitectureLayer<B>,
    bn: BatchNorm<B, 2>,
    output: Conv2d<B>,
}

impl<B: Backend> PolicyHead<B> {
    pub fn new(builder: &mut LayerBuilder<'_, B>, name: &str, in_channels: usize) -> Self {
        let config = builder.config().clone();
        let filters = config.filter_count;

        let layer = builder.architecture_layer(
            format!("{name}/{}_{filters}", config.architecture),
            in_channels,
        );
        let bn = builder.batch_norm(format!("{name}/batchnorm"), filters);
        let output = builder.conv2d(
            format!("{name}/conv2d_{}", config.output_planes_count),
            [filters, config.output_planes_count],
            1,
            true,
        );

        Self {
            layer,
            bn,
            output,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.layer.forward(x);
        let x = self.bn.forward(x);
        let x = relu(x);
        self.output.forward(x)
    }
}

impl<B: Backend> Regularized<B> for PolicyHead<B> {
    fn squared_weights(&self) -> Tensor<B, 1> {
        self.layer.squared_weights() + self.output.squared_weights()
    }
}

/// Reshapes channel-first trunk features `[B, C, 8, 8]` into a square-major
/// token sequence `[B, 64, C]`.
pub fn commentary_encoder_head<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    x.reshape([batch, channels, height * width]).swap_dims(1, 2)
}

pub(crate) fn to_channels_first<B: Backend>(x: Tensor<B, 4>, format: DataFormat) -> Tensor<B, 4> {
    match format {
        DataFormat::ChannelsFirst => x,
        DataFormat::ChannelsLast => x.permute([0, 3, 1, 2]),
    }
}

pub(crate) fn from_channels_first<B: Backend>(
    x: Tensor<B, 4>,
    format: DataFormat,
) -> Tensor<B, 4> {
    match format {
        DataFormat::ChannelsFirst => x,
        DataFormat::ChannelsLast => x.permute([0, 2, 3, 1]),
    }
}

pub(crate) fn ensure_width(
    component: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), ModelError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::ShapeMismatch {
            component,
            expected,
            actual,
        })
    }
}

/// Shared trunk with value, MCTS value, policy and reply-policy heads.
///
/// Heads never share weights with each other; they only share the trunk's
/// features. The commentary encoder output is a reshape of those features.
#[derive(Module, Debug)]
pub struct ChessCoachModel<B: Backend> {
    trunk: Trunk<B>,
    value: ValueHead<B>,
    mcts_value: ValueHead<B>,
    policy: PolicyHead<B>,
    reply_policy: PolicyHead<B>,
    input_planes_count: usize,
}

impl<B: Backend> ChessCoachModel<B> {
    pub fn new(device: &Device<B>, config: &ModelConfig) -> Result<Self, ModelError> {
        let mut builder = LayerBuilder::new(device, config);
        Self::build(&mut builder)
    }

    /// Validates the builder's config, then builds trunk and heads.
    pub fn build(builder: &mut LayerBuilder<'_, B>) -> Result<Self, ModelError> {
        let config = builder.config().clone();
        config.validate()?;

        tracing::info!(
            "Building model: architecture={}, filters={}, residual_blocks={}",
            config.architecture,
            config.filter_count,
            config.residual_count
        );

        let trunk = Trunk::new(builder);
        let width = trunk.output_channels();

        let value = ValueHead::new(builder, "value", width);
        let mcts_value = ValueHead::new(builder, "mcts_value", width);
        let policy = PolicyHead::new(builder, "policy", width);
        let reply_policy = PolicyHead::new(builder, "reply_policy", width);

        let model = Self {
            trunk,
            value,
            mcts_value,
            policy,
            reply_policy,
            input_planes_count: config.input_planes_count,
        };
        tracing::info!("Built model with {} parameters", model.num_params());
        Ok(model)
    }

    pub fn filter_count(&self) -> usize {
        self.trunk.output_channels()
    }

    /// Checks a `[batch, ...]` input shape against the board planes for `format`.
    pub fn check_input(&self, dims: [usize; 4], format: DataFormat) -> Result<(), ModelError> {
        let [_, d1, d2, d3] = dims;
        let expected = format.spatial_shape(self.input_planes_count);
        if [d1, d2, d3] == expected {
            return Ok(());
        }
        let (expected_planes, actual_planes) = match format {
            DataFormat::ChannelsFirst => (expected[0], d1),
            DataFormat::ChannelsLast => (expected[2], d3),
        };
        if expected_planes != actual_planes {
            ensure_width("input planes", expected_planes, actual_planes)
        } else {
            let sides = match format {
                DataFormat::ChannelsFirst => [d2, d3],
                DataFormat::ChannelsLast => [d1, d2],
            };
            let actual_side = sides
                .into_iter()
                .find(|&side| side != BOARD_SIDE)
                .unwrap_or(BOARD_SIDE);
            ensure_width("board side", BOARD_SIDE, actual_side)
        }
    }

    fn features(&self, input: Tensor<B, 4>, format: DataFormat) -> Tensor<B, 4> {
        if let Err(err) = self.check_input(input.dims(), format) {
            panic!("{err}");
        }
        self.trunk.forward(to_channels_first(input, format))
    }

    fn play_heads(&self, features: Tensor<B, 4>, format: DataFormat) -> PlayOutput<B> {
        PlayOutput {
            value: self.value.forward(features.clone()),
            mcts_value: self.mcts_value.forward(features.clone()),
            policy: from_channels_first(self.policy.forward(features.clone()), format),
            reply_policy: from_channels_first(self.reply_policy.forward(features), format),
        }
    }

    /// Runs the trunk once and every head on its features.
    ///
    /// # Panics
    ///
    /// If the input shape fails [`ChessCoachModel::check_input`].
    pub fn forward(&self, input: Tensor<B, 4>, format: DataFormat) -> ModelOutput<B> {
        let features = self.features(input, format);
        ModelOutput {
            play: self.play_heads(features.clone(), format),
            commentary_encoder: commentary_encoder_head(features),
        }
    }

    /// # Panics
    ///
    /// If the input shape fails [`ChessCoachModel::check_input`].
    pub fn forward_play(&self, input: Tensor<B, 4>, format: DataFormat) -> PlayOutput<B> {
        let features = self.features(input, format);
        self.play_heads(features, format)
    }

    /// # Panics
    ///
    /// If the input shape fails [`ChessCoachModel::check_input`].
    pub fn forward_commentary_encoder(
        &self,
        input: Tensor<B, 4>,
        format: DataFormat,
    ) -> Tensor<B, 3> {
        commentary_encoder_head(self.features(input, format))
    }

    /// `weight_decay * sum(w^2)` over every kernel of the trunk and heads.
    pub fn regularization_loss(&self, weight_decay: f64) -> Tensor<B, 1> {
        let squared = self.trunk.squared_weights()
            + self.value.squared_weights()
            + self.mcts_value.squared_weights()
            + self.policy.squared_weights()
            + self.reply_policy.squared_weights();
        squared.mul_scalar(weight_decay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Architecture;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config(architecture: Architecture) -> ModelConfig {
        ModelConfig::new(architecture, 16, 2)
            .with_attention_heads(4)
            .with_dense_count(32)
    }

    #[test]
    fn value_outputs_are_bounded() {
        let device = Default::default();
        for architecture in Architecture::ALL {
            let model =
                ChessCoachModel::<TestBackend>::new(&device, &small_config(architecture)).unwrap();
            let input = Tensor::random([4, 101, 8, 8], Distribution::Normal(0.0, 50.0), &device);
            let output = model.forward_play(input, DataFormat::ChannelsFirst);

            for value in [output.value, output.mcts_value] {
                assert_eq!(value.dims(), [4, 1]);
                for v in value.into_data().iter::<f32>() {
                    assert!((-1.0..=1.0).contains(&v), "{architecture}: {v}");
                }
            }
        }
    }

    #[test]
    fn heads_have_independent_weights() {
        let device = Default::default();
        let model =
            ChessCoachModel::<TestBackend>::new(&device, &small_config(Architecture::Conv2d))
                .unwrap();
        let value = model.value.output.weight.val();
        let mcts_value = model.mcts_value.output.weight.val();
        let diff = (value - mcts_value).abs().sum().into_scalar();
        assert!(diff > 0.0, "value heads must be initialised independently");
        assert_ne!(model.value.output.weight.id, model.mcts_value.output.weight.id);
        assert_ne!(model.policy.output.weight.id, model.reply_policy.output.weight.id);
    }

    #[test]
    fn commentary_encoder_head_is_square_major() {
        let device = Default::default();
        // Channel c at square s holds 100 * c + s.
        let data: Vec<f32> = (0..3)
            .flat_map(|c| (0..BOARD_SQUARES).map(move |s| (100 * c + s) as f32))
            .collect();
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(data, [1, 3, BOARD_SIDE, BOARD_SIDE]),
            &device,
        );

        let sequence = commentary_encoder_head(x);
        assert_eq!(sequence.dims(), [1, BOARD_SQUARES, 3]);

        let token = sequence.slice([0..1, 10..11, 0..3]).into_data();
        assert_eq!(token.iter::<f32>().collect::<Vec<_>>(), vec![10.0, 110.0, 210.0]);
    }

    #[test]
    fn channels_last_matches_channels_first() {
        let device = Default::default();
        let model =
            ChessCoachModel::<TestBackend>::new(&device, &small_config(Architecture::Augmented))
                .unwrap();
        let input = Tensor::<TestBackend, 4>::random(
            [2, 101, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let first = model.forward(input.clone(), DataFormat::ChannelsFirst);
        let last = model.forward(input.permute([0, 2, 3, 1]), DataFormat::ChannelsLast);

        assert_eq!(last.play.policy.dims(), [2, 8, 8, 73]);
        let policy_diff = (first.play.policy.permute([0, 2, 3, 1]) - last.play.policy)
            .abs()
            .max()
            .into_scalar();
        let encoder_diff = (first.commentary_encoder - last.commentary_encoder)
            .abs()
            .max()
            .into_scalar();
        assert!(policy_diff < 1e-4, "{policy_diff}");
        assert!(encoder_diff < 1e-4, "{encoder_diff}");
    }

    #[test]
    #[should_panic]
    fn wrong_input_planes_panic() {
        let device = Default::default();
        let model =
            ChessCoachModel::<TestBackend>::new(&device, &small_config(Architecture::Conv2d))
                .unwrap();
        let _ = model.forward(Tensor::zeros([1, 12, 8, 8], &device), DataFormat::ChannelsFirst);
    }

    #[test]
    fn input_shape_errors_name_the_mismatch() {
        let device = Default::default();
        let model =
            ChessCoachModel::<TestBackend>::new(&device, &small_config(Architecture::Conv2d))
                .unwrap();

        assert!(model.check_input([3, 101, 8, 8], DataFormat::ChannelsFirst).is_ok());
        assert!(model.check_input([3, 8, 8, 101], DataFormat::ChannelsLast).is_ok());
        assert!(matches!(
            model.check_input([1, 12, 8, 8], DataFormat::ChannelsFirst),
            Err(ModelError::ShapeMismatch {
                component: "input planes",
                expected: 101,
                actual: 12
            })
        ));
        assert!(matches!(
            model.check_input([1, 101, 8, 8], DataFormat::ChannelsLast),
            Err(ModelError::ShapeMismatch {
                component: "input planes",
                ..
            })
        ));
        assert!(matches!(
            model.check_input([1, 101, 8, 9], DataFormat::ChannelsFirst),
            Err(ModelError::ShapeMismatch {
                component: "board side",
                expected: 8,
                actual: 9
            })
        ));
    }

    #[test]
    fn invalid_config_fails_before_building() {
        let device = Default::default();
        let config = ModelConfig::new(Architecture::Attention, 18, 2).with_attention_heads(4);
        let err = ChessCoachModel::<TestBackend>::new(&device, &config).unwrap_err();
        assert!(matches!(err, ModelError::Config(_)), "{err}");
    }

    #[test]
    fn regularization_scales_with_weight_decay() {
        let device = Default::default();
        let model =
            ChessCoachModel::<TestBackend>::new(&device, &small_config(Architecture::Attention))
                .unwrap();
        let base = model.regularization_loss(1.0).into_scalar();
        let decayed = model.regularization_loss(1e-4).into_scalar();
        assert!(base > 0.0);
        assert!((decayed - base * 1e-4).abs() < 1e-6 * base.max(1.0));
    }

    #[test]
    fn gradients_reach_the_shared_trunk_from_every_head() {
        use burn_autodiff::Autodiff;
        type AutodiffBackend = Autodiff<TestBackend>;

        let device = Default::default();
        let model = ChessCoachModel::<AutodiffBackend>::new(
            &device,
            &small_config(Architecture::Conv2d),
        )
        .unwrap();
        let input: Tensor<AutodiffBackend, 4> =
            Tensor::random([2, 101, 8, 8], Distribution::Normal(0.0, 1.0), &device);

        for name in OutputName::ALL {
            let output = model.forward(input.clone(), DataFormat::ChannelsFirst);
            let loss = match name {
                OutputName::Value => output.play.value.sum(),
                OutputName::MctsValue => output.play.mcts_value.sum(),
                OutputName::Policy => output.play.policy.sum(),
                OutputName::ReplyPolicy => output.play.reply_policy.sum(),
                OutputName::CommentaryEncoder => output.commentary_encoder.sum(),
            };
            let grads = loss.backward();
            assert!(
                model.trunk.input_conv.weight.val().grad(&grads).is_some(),
                "{}",
                name.as_str()
            );
        }
    }
}
