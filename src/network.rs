use burn::prelude::*;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{DataFormat, ModelConfig};
use crate::error::{ConfigError, ModelError};
use crate::layers::LayerBuilder;
use crate::model::{ChessCoachModel, HeadOutput, ModelOutput, OutputName, PlayOutput};

/// Named subsets of the composed model's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubgraphView {
    /// Value, MCTS value, policy and reply policy.
    Play,
    /// The commentary encoder sequence.
    CommentaryEncoder,
}

impl SubgraphView {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubgraphView::Play => "play",
            SubgraphView::CommentaryEncoder => "commentary_encoder",
        }
    }

    pub fn outputs(&self) -> &'static [OutputName] {
        match self {
            SubgraphView::Play => &OutputName::ALL[..4],
            SubgraphView::CommentaryEncoder => &OutputName::ALL[4..],
        }
    }
}

impl fmt::Display for SubgraphView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubgraphView {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [SubgraphView::Play, SubgraphView::CommentaryEncoder]
            .into_iter()
            .find(|view| view.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownView(s.to_string()))
    }
}

/// Gameplay view; only runs the trunk and the four gameplay heads.
#[derive(Debug, Clone)]
pub struct PlayModel<B: Backend> {
    model: Arc<ChessCoachModel<B>>,
    data_format: DataFormat,
}

impl<B: Backend> PlayModel<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> PlayOutput<B> {
        self.model.forward_play(input, self.data_format)
    }

    pub fn shares_weights_with(&self, model: &Arc<ChessCoachModel<B>>) -> bool {
        Arc::ptr_eq(&self.model, model)
    }
}

/// Commentary encoder view; only runs the trunk and the reshape head.
#[derive(Debug, Clone)]
pub struct CommentaryEncoderModel<B: Backend> {
    model: Arc<ChessCoachModel<B>>,
    data_format: DataFormat,
}

impl<B: Backend> CommentaryEncoderModel<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 3> {
        self.model.forward_commentary_encoder(input, self.data_format)
    }

    /// Width of every encoded square token.
    pub fn encoding_width(&self) -> usize {
        self.model.filter_count()
    }

    pub fn shares_weights_with(&self, model: &Arc<ChessCoachModel<B>>) -> bool {
        Arc::ptr_eq(&self.model, model)
    }
}

/// A view requested by name.
#[derive(Debug, Clone)]
pub enum ModelView<B: Backend> {
    Play(PlayModel<B>),
    CommentaryEncoder(CommentaryEncoderModel<B>),
}

impl<B: Backend> ModelView<B> {
    pub fn kind(&self) -> SubgraphView {
        match self {
            ModelView::Play(_) => SubgraphView::Play,
            ModelView::CommentaryEncoder(_) => SubgraphView::CommentaryEncoder,
        }
    }

    /// Outputs in the order given by [`SubgraphView::outputs`].
    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<(OutputName, HeadOutput<B>)> {
        match self {
            ModelView::Play(play) => play.forward(input).into_named(),
            ModelView::CommentaryEncoder(encoder) => vec![(
                OutputName::CommentaryEncoder,
                HeadOutput::Sequence(encoder.forward(input)),
            )],
        }
    }
}

/// The composed multi-output model and its two cached views.
///
/// The views hold the same `Arc` as the composed model, so no view owns or
/// duplicates trunk weights.
#[derive(Debug, Clone)]
pub struct ComposedModel<B: Backend> {
    model: Arc<ChessCoachModel<B>>,
    config: ModelConfig,
    layer_names: Vec<String>,
    play: PlayModel<B>,
    commentary_encoder: CommentaryEncoderModel<B>,
}

impl<B: Backend> ComposedModel<B> {
    pub fn build(device: &Device<B>, config: &ModelConfig) -> Result<Self, ModelError> {
        let mut builder = LayerBuilder::new(device, config);
        let model = ChessCoachModel::build(&mut builder)?;
        Ok(Self::from_parts(model, config.clone(), builder.into_names()))
    }

    pub(crate) fn from_parts(
        model: ChessCoachModel<B>,
        config: ModelConfig,
        layer_names: Vec<String>,
    ) -> Self {
        let model = Arc::new(model);
        let play = PlayModel {
            model: Arc::clone(&model),
            data_format: config.data_format,
        };
        let commentary_encoder = CommentaryEncoderModel {
            model: Arc::clone(&model),
            data_format: config.data_format,
        };
        tracing::debug!(
            "Derived views {} and {} from one model",
            SubgraphView::Play,
            SubgraphView::CommentaryEncoder
        );

        Self {
            model,
            config,
            layer_names,
            play,
            commentary_encoder,
        }
    }

    pub fn model(&self) -> &Arc<ChessCoachModel<B>> {
        &self.model
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Hierarchical layer names in construction order.
    pub fn layer_names(&self) -> &[String] {
        &self.layer_names
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> ModelOutput<B> {
        self.model.forward(input, self.config.data_format)
    }

    pub fn play(&self) -> &PlayModel<B> {
        &self.play
    }

    pub fn commentary_encoder(&self) -> &CommentaryEncoderModel<B> {
        &self.commentary_encoder
    }

    pub fn view(&self, view: SubgraphView) -> ModelView<B> {
        match view {
            SubgraphView::Play => ModelView::Play(self.play.clone()),
            SubgraphView::CommentaryEncoder => {
                ModelView::CommentaryEncoder(self.commentary_encoder.clone())
            }
        }
    }

    pub fn view_by_name(&self, name: &str) -> Result<ModelView<B>, ConfigError> {
        Ok(self.view(name.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Architecture;
    use burn_ndarray::NdArray;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;

    fn composed() -> ComposedModel<TestBackend> {
        let config = ModelConfig::new(Architecture::Conv2d, 16, 1).with_dense_count(16);
        ComposedModel::build(&Default::default(), &config).unwrap()
    }

    #[test]
    fn views_alias_the_composed_model() {
        let composed = composed();
        assert!(composed.play().shares_weights_with(composed.model()));
        assert!(composed.commentary_encoder().shares_weights_with(composed.model()));
        // Composed model plus two cached views.
        assert_eq!(Arc::strong_count(composed.model()), 3);
    }

    #[test]
    fn views_select_contract_outputs() {
        let composed = composed();
        let input = Tensor::zeros([2, 101, 8, 8], &Default::default());

        let play = composed.view_by_name("play").unwrap();
        let names: Vec<_> = play.forward(input.clone()).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, SubgraphView::Play.outputs());

        let encoder = composed.view_by_name("commentary_encoder").unwrap();
        let outputs = encoder.forward(input);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0, OutputName::CommentaryEncoder);
        assert_eq!(outputs[0].1.dims(), vec![2, 64, 16]);
    }

    #[test]
    fn views_match_full_forward() {
        let composed = composed();
        let input = Tensor::<TestBackend, 4>::random(
            [2, 101, 8, 8],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &Default::default(),
        );
        let full = composed.forward(input.clone());
        let play = composed.play().forward(input.clone());
        let encoding = composed.commentary_encoder().forward(input);

        let value_diff = (full.play.value - play.value).abs().max().into_scalar();
        let encoding_diff = (full.commentary_encoder - encoding).abs().max().into_scalar();
        assert!(value_diff < 1e-6);
        assert!(encoding_diff < 1e-6);
    }

    #[test]
    fn unknown_view_is_rejected() {
        let composed = composed();
        assert!(matches!(
            composed.view_by_name("training"),
            Err(ConfigError::UnknownView(name)) if name == "training"
        ));
    }

    #[test]
    fn layer_names_are_unique() {
        let composed = composed();
        let names = composed.layer_names();
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(names.first().map(String::as_str), Some("initial/conv2d_16"));
        assert!(names.contains(&"reply_policy/conv2d_16".to_string()));
        assert!(names.contains(&"mcts_value/dense_1".to_string()));
    }
}
