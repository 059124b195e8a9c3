use burn::prelude::*;

use crate::config::CommentaryConfig;
use crate::error::ModelError;
use crate::model::ensure_width;
use crate::network::CommentaryEncoderModel;
use crate::storage::Storage;
use crate::tokenizer::{pad_sequences, shift_for_teacher_forcing, Vocabulary, RESERVED_TOKENS};
use crate::transformer::{masked_cross_entropy, CommentaryTransformer};

/// Decoder vocabulary size for a config: reserved tokens plus corpus tokens.
pub fn decoder_vocab_size(config: &CommentaryConfig) -> usize {
    RESERVED_TOKENS.len() + config.transformer_num_words
}

/// Loads the persisted vocabulary, or builds it from the corpus and persists
/// it so later runs keep the same token ids.
pub fn load_or_build_vocabulary(
    config: &CommentaryConfig,
    storage: &dyn Storage,
) -> Result<Vocabulary, ModelError> {
    if storage.file_exists(&config.vocabulary_path) {
        return Ok(Vocabulary::load(storage, &config.vocabulary_path)?);
    }

    tracing::info!(
        "No vocabulary at {}, building from {}",
        config.vocabulary_path,
        config.corpus_path
    );
    let vocabulary = Vocabulary::build_from_storage(
        storage,
        &config.corpus_path,
        config.transformer_num_words,
        config.tokenizer.clone(),
    )?;
    vocabulary.save(storage, &config.vocabulary_path)?;
    Ok(vocabulary)
}

/// Builds the commentary decoder and the vocabulary its ids belong to.
///
/// `encoder_width` is the width of the board tokens produced by the
/// commentary encoder view.
pub fn build_commentary_decoder<B: Backend>(
    config: &CommentaryConfig,
    storage: &dyn Storage,
    encoder_width: usize,
    device: &Device<B>,
) -> Result<(CommentaryTransformer<B>, Vocabulary), ModelError> {
    config.validate()?;
    ensure_width(
        "commentary decoder",
        config.transformer_filters,
        encoder_width,
    )?;

    let vocabulary = load_or_build_vocabulary(config, storage)?;
    let vocab_size = decoder_vocab_size(config);
    vocabulary.ensure_capacity(vocab_size)?;

    Ok((CommentaryTransformer::new(device, config, vocab_size), vocabulary))
}

/// `[batch, max_length]` id tensor, post-padded with `<pad>`.
pub fn sequences_to_tensor<B: Backend>(
    sequences: &[Vec<usize>],
    max_length: usize,
    device: &Device<B>,
) -> Tensor<B, 2, Int> {
    let batch = sequences.len();
    let flat: Vec<i64> = pad_sequences(sequences, max_length)
        .into_iter()
        .flatten()
        .map(|id| id as i64)
        .collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(flat, [batch * max_length]), device)
        .reshape([batch, max_length])
}

/// Teacher-forced decoder inputs and targets for a batch of comments.
pub fn teacher_forcing_batch<B: Backend>(
    vocabulary: &Vocabulary,
    comments: &[&str],
    max_length: usize,
    device: &Device<B>,
) -> (Tensor<B, 2, Int>, Tensor<B, 2, Int>) {
    let (inputs, targets): (Vec<_>, Vec<_>) = comments
        .iter()
        .map(|comment| shift_for_teacher_forcing(&vocabulary.encode(comment)))
        .unzip();
    // The shifted pair is one token shorter than the encoded comment.
    let width = max_length.saturating_sub(1).max(1);
    (
        sequences_to_tensor(&inputs, width, device),
        sequences_to_tensor(&targets, width, device),
    )
}

/// Couples the commentary encoder view, the decoder and its vocabulary.
#[derive(Debug, Clone)]
pub struct CommentaryGenerator<B: Backend> {
    encoder: CommentaryEncoderModel<B>,
    decoder: CommentaryTransformer<B>,
    vocabulary: Vocabulary,
}

impl<B: Backend> CommentaryGenerator<B> {
    pub fn new(
        encoder: CommentaryEncoderModel<B>,
        decoder: CommentaryTransformer<B>,
        vocabulary: Vocabulary,
    ) -> Result<Self, ModelError> {
        ensure_width(
            "commentary decoder",
            decoder.d_model(),
            encoder.encoding_width(),
        )?;
        vocabulary.ensure_capacity(decoder.vocab_size())?;
        Ok(Self {
            encoder,
            decoder,
            vocabulary,
        })
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn decoder(&self) -> &CommentaryTransformer<B> {
        &self.decoder
    }

    /// Mean token loss of the given comments for each input position.
    pub fn loss(&self, positions: Tensor<B, 4>, comments: &[&str]) -> Tensor<B, 1> {
        let device = positions.device();
        let board = self.encoder.forward(positions);
        let (inputs, targets) = teacher_forcing_batch(
            &self.vocabulary,
            comments,
            self.decoder.max_length(),
            &device,
        );
        masked_cross_entropy(self.decoder.forward(board, inputs), targets)
    }

    /// One greedy comment per input position.
    pub fn comment(&self, positions: Tensor<B, 4>) -> Vec<String> {
        let board = self.encoder.forward(positions);
        self.decoder
            .generate(board)
            .iter()
            .map(|ids| self.vocabulary.decode(ids))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Architecture, ModelConfig};
    use crate::error::VocabularyError;
    use crate::network::ComposedModel;
    use crate::storage::LocalStorage;
    use crate::tokenizer::{END_ID, PAD_ID, START_ID};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn commentary_config() -> CommentaryConfig {
        CommentaryConfig {
            transformer_layers: 1,
            transformer_filters: 16,
            transformer_heads: 4,
            transformer_feedforward: 32,
            transformer_num_words: 20,
            transformer_max_length: 10,
            ..CommentaryConfig::default()
        }
    }

    fn storage_with_corpus(temp_dir: &TempDir) -> LocalStorage {
        let storage = LocalStorage::new(temp_dir.path());
        storage
            .save_file(
                &commentary_config().corpus_path,
                b"What a great move\nA blunder!\nThe knight is trapped\n",
            )
            .unwrap();
        storage
    }

    #[test]
    fn builds_and_persists_vocabulary_once() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with_corpus(&temp_dir);
        let config = commentary_config();

        let (decoder, vocabulary) =
            build_commentary_decoder::<TestBackend>(&config, &storage, 16, &Default::default())
                .unwrap();
        assert_eq!(decoder.vocab_size(), 24);
        assert!(storage.file_exists(&config.vocabulary_path));

        // A different corpus must not change ids once the vocabulary exists.
        storage
            .save_file(&config.corpus_path, b"completely different words\n")
            .unwrap();
        let (_, reloaded) =
            build_commentary_decoder::<TestBackend>(&config, &storage, 16, &Default::default())
                .unwrap();
        assert_eq!(reloaded, vocabulary);
        assert_eq!(reloaded.id("great"), vocabulary.id("great"));
    }

    #[test]
    fn decoder_width_must_match_encoder() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with_corpus(&temp_dir);
        let result = build_commentary_decoder::<TestBackend>(
            &commentary_config(),
            &storage,
            128,
            &Default::default(),
        );
        assert!(matches!(
            result,
            Err(ModelError::ShapeMismatch {
                expected: 16,
                actual: 128,
                ..
            })
        ));
    }

    #[test]
    fn vocabulary_size_change_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with_corpus(&temp_dir);
        build_commentary_decoder::<TestBackend>(
            &commentary_config(),
            &storage,
            16,
            &Default::default(),
        )
        .unwrap();

        let resized = CommentaryConfig {
            transformer_num_words: 50,
            ..commentary_config()
        };
        let result =
            build_commentary_decoder::<TestBackend>(&resized, &storage, 16, &Default::default());
        assert!(matches!(
            result,
            Err(ModelError::Vocabulary(VocabularyError::SizeMismatch {
                expected: 54,
                actual: 24
            }))
        ));
    }

    #[test]
    fn teacher_forcing_batch_shifts_and_pads() {
        let vocabulary = Vocabulary::build(
            ["great move"],
            10,
            commentary_config().tokenizer,
        );
        let (inputs, targets) = teacher_forcing_batch::<TestBackend>(
            &vocabulary,
            &["great move", "move"],
            5,
            &Default::default(),
        );
        let great = vocabulary.id("great") as i64;
        let mv = vocabulary.id("move") as i64;
        let (start, end, pad) = (START_ID as i64, END_ID as i64, PAD_ID as i64);

        let inputs: Vec<i64> = inputs.into_data().iter::<i64>().collect();
        let targets: Vec<i64> = targets.into_data().iter::<i64>().collect();
        assert_eq!(inputs, vec![start, great, mv, pad, start, mv, pad, pad]);
        assert_eq!(targets, vec![great, mv, end, pad, mv, end, pad, pad]);
    }

    #[test]
    fn generator_comments_on_every_position() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with_corpus(&temp_dir);
        let device = Default::default();

        let model_config = ModelConfig::new(Architecture::Conv2d, 16, 1).with_dense_count(16);
        let composed = ComposedModel::<TestBackend>::build(&device, &model_config).unwrap();
        let (decoder, vocabulary) = build_commentary_decoder(
            &commentary_config(),
            &storage,
            composed.commentary_encoder().encoding_width(),
            &device,
        )
        .unwrap();
        let generator =
            CommentaryGenerator::new(composed.commentary_encoder().clone(), decoder, vocabulary)
                .unwrap();

        let positions = Tensor::zeros([2, 101, 8, 8], &device);
        assert_eq!(generator.comment(positions.clone()).len(), 2);

        let loss = generator
            .loss(positions, &["What a great move", "A blunder"])
            .into_scalar();
        assert!(loss.is_finite() && loss > 0.0, "{loss}");
    }
}
