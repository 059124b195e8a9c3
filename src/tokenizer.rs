use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::TokenizerConfig;
use crate::error::VocabularyError;
use crate::storage::Storage;

pub const PAD_TOKEN: &str = "<pad>";
pub const UNKNOWN_TOKEN: &str = "<unk>";
pub const START_TOKEN: &str = "<start>";
pub const END_TOKEN: &str = "<end>";

pub const PAD_ID: usize = 0;
pub const UNKNOWN_ID: usize = 1;
pub const START_ID: usize = 2;
pub const END_ID: usize = 3;

/// Reserved tokens, indexed by their ids.
pub const RESERVED_TOKENS: [&str; 4] = [PAD_TOKEN, UNKNOWN_TOKEN, START_TOKEN, END_TOKEN];

/// On-disk form of a [`Vocabulary`].
#[derive(Debug, Serialize, Deserialize)]
struct VocabularyFile {
    max_words: usize,
    tokenizer: TokenizerConfig,
    tokens: Vec<String>,
}

/// Token/id mapping for commentary sequences.
///
/// Ids are the token's index: the four reserved tokens come first (`<pad>`
/// is always 0), followed by corpus tokens by descending frequency. Once
/// built the vocabulary never changes; decoders trained against it must be
/// served with the reloaded file, not a rebuilt one.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    max_words: usize,
    tokenizer: TokenizerConfig,
    tokens: Vec<String>,
    ids: HashMap<String, usize>,
}

impl Vocabulary {
    /// Builds from a comment corpus, keeping at most `max_words` corpus tokens.
    ///
    /// Ties in frequency keep the order in which tokens first appear.
    pub fn build<'a>(
        comments: impl IntoIterator<Item = &'a str>,
        max_words: usize,
        tokenizer: TokenizerConfig,
    ) -> Self {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut comment_count = 0;
        for comment in comments {
            comment_count += 1;
            for token in split_tokens(&tokenizer, comment) {
                if RESERVED_TOKENS.contains(&token.as_str()) {
                    continue;
                }
                let first_seen = counts.len();
                counts.entry(token).or_insert((0, first_seen)).0 += 1;
            }
        }

        let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|(_, (count_a, seen_a)), (_, (count_b, seen_b))| {
            count_b.cmp(count_a).then(seen_a.cmp(seen_b))
        });
        let corpus_tokens = ranked.len();

        let tokens = RESERVED_TOKENS
            .iter()
            .map(|token| token.to_string())
            .chain(ranked.into_iter().take(max_words).map(|(token, _)| token))
            .collect();

        let vocabulary = Self::from_tokens(max_words, tokenizer, tokens);
        tracing::info!(
            "Built vocabulary from {} comments: kept {} of {} distinct tokens",
            comment_count,
            vocabulary.len() - RESERVED_TOKENS.len(),
            corpus_tokens
        );
        vocabulary
    }

    /// Builds from a newline-separated corpus file.
    pub fn build_from_storage(
        storage: &dyn Storage,
        corpus_path: &str,
        max_words: usize,
        tokenizer: TokenizerConfig,
    ) -> Result<Self, VocabularyError> {
        let bytes = storage.load_file(corpus_path)?;
        let corpus = String::from_utf8_lossy(&bytes);
        Ok(Self::build(
            corpus.lines().filter(|line| !line.trim().is_empty()),
            max_words,
            tokenizer,
        ))
    }

    fn from_tokens(max_words: usize, tokenizer: TokenizerConfig, tokens: Vec<String>) -> Self {
        let ids = tokens
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id))
            .collect();
        Self {
            max_words,
            tokenizer,
            tokens,
            ids,
        }
    }

    /// Number of tokens, reserved ones included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Size of the id space a decoder must cover, independent of corpus size.
    pub fn capacity(&self) -> usize {
        RESERVED_TOKENS.len().saturating_add(self.max_words)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn tokenizer(&self) -> &TokenizerConfig {
        &self.tokenizer
    }

    pub fn id(&self, token: &str) -> usize {
        self.ids.get(token).copied().unwrap_or(UNKNOWN_ID)
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    /// Normalised tokens of `text`, without start/end markers.
    pub fn split(&self, text: &str) -> Vec<String> {
        split_tokens(&self.tokenizer, text)
    }

    /// `<start> tokens... <end>` as ids; out-of-vocabulary tokens map to `<unk>`.
    pub fn encode(&self, comment: &str) -> Vec<usize> {
        std::iter::once(START_ID)
            .chain(self.split(comment).iter().map(|token| self.id(token)))
            .chain(std::iter::once(END_ID))
            .collect()
    }

    /// Joins tokens up to the first `<end>`, dropping `<pad>` and `<start>`.
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .take_while(|&&id| id != END_ID)
            .filter(|&&id| id != PAD_ID && id != START_ID)
            .map(|&id| self.token(id).unwrap_or(UNKNOWN_TOKEN))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Fails unless this vocabulary's id space is exactly `expected`.
    pub fn ensure_capacity(&self, expected: usize) -> Result<(), VocabularyError> {
        if self.capacity() == expected {
            Ok(())
        } else {
            Err(VocabularyError::SizeMismatch {
                expected,
                actual: self.capacity(),
            })
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, VocabularyError> {
        let file = VocabularyFile {
            max_words: self.max_words,
            tokenizer: self.tokenizer.clone(),
            tokens: self.tokens.clone(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, VocabularyError> {
        let file: VocabularyFile = serde_json::from_slice(bytes)?;

        for (id, reserved) in RESERVED_TOKENS.iter().enumerate() {
            if file.tokens.get(id).map(String::as_str) != Some(*reserved) {
                return Err(VocabularyError::Corrupt(format!(
                    "expected reserved token {reserved} at id {id}"
                )));
            }
        }
        let capacity = RESERVED_TOKENS
            .len()
            .checked_add(file.max_words)
            .ok_or_else(|| {
                VocabularyError::Corrupt(format!("max_words {} overflows", file.max_words))
            })?;
        if file.tokens.len() > capacity {
            return Err(VocabularyError::Corrupt(format!(
                "{} tokens exceed capacity {}",
                file.tokens.len(),
                capacity
            )));
        }

        let vocabulary = Self::from_tokens(file.max_words, file.tokenizer, file.tokens);
        if vocabulary.ids.len() != vocabulary.tokens.len() {
            return Err(VocabularyError::Corrupt("duplicate tokens".to_string()));
        }
        Ok(vocabulary)
    }

    pub fn save(&self, storage: &dyn Storage, path: &str) -> Result<(), VocabularyError> {
        storage.save_file(path, &self.to_json()?)?;
        tracing::info!("Saved vocabulary of {} tokens to {}", self.len(), path);
        Ok(())
    }

    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self, VocabularyError> {
        let vocabulary = Self::from_json(&storage.load_file(path)?)?;
        tracing::info!("Loaded vocabulary of {} tokens from {}", vocabulary.len(), path);
        Ok(vocabulary)
    }
}

fn split_tokens(tokenizer: &TokenizerConfig, text: &str) -> Vec<String> {
    let text = if tokenizer.lowercase {
        text.to_lowercase()
    } else {
        text.to_string()
    };
    text.chars()
        .map(|c| if tokenizer.filters.contains(c) { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Post-pads with `<pad>` and truncates each sequence to `max_length`.
pub fn pad_sequences(sequences: &[Vec<usize>], max_length: usize) -> Vec<Vec<usize>> {
    sequences
        .iter()
        .map(|sequence| {
            let mut padded: Vec<usize> = sequence.iter().copied().take(max_length).collect();
            padded.resize(max_length, PAD_ID);
            padded
        })
        .collect()
}

/// Splits `<start> a b <end>` into decoder input `<start> a b` and target
/// `a b <end>`.
pub fn shift_for_teacher_forcing(sequence: &[usize]) -> (Vec<usize>, Vec<usize>) {
    match sequence.len() {
        0 => (Vec::new(), Vec::new()),
        n => (sequence[..n - 1].to_vec(), sequence[1..].to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn vocabulary(corpus: &[&str], max_words: usize) -> Vocabulary {
        Vocabulary::build(corpus.iter().copied(), max_words, TokenizerConfig::default())
    }

    #[test]
    fn reserved_tokens_and_case_insensitive_corpus_tokens() {
        let vocabulary = vocabulary(&["What a great move"], 5000);

        assert_eq!(vocabulary.id(PAD_TOKEN), 0);
        let reserved = [
            vocabulary.id(START_TOKEN),
            vocabulary.id(END_TOKEN),
            vocabulary.id(UNKNOWN_TOKEN),
        ];
        assert!(reserved.iter().all(|&id| id != 0));
        assert_ne!(reserved[0], reserved[1]);
        assert_ne!(reserved[1], reserved[2]);
        assert_ne!(reserved[0], reserved[2]);

        for token in ["what", "a", "great", "move"] {
            assert!(vocabulary.id(token) >= RESERVED_TOKENS.len(), "{token}");
        }
        assert_eq!(vocabulary.len(), 8);
    }

    #[test]
    fn tokens_ranked_by_frequency_then_first_appearance() {
        let vocabulary = vocabulary(
            &["The knight takes the pawn.", "The queen defends", "Knight to f3!"],
            6,
        );
        insta::assert_snapshot!(vocabulary.tokens().join("\n"), @r"
        <pad>
        <unk>
        <start>
        <end>
        the
        knight
        takes
        pawn
        queen
        defends
        ");
        assert_eq!(vocabulary.id("f3"), UNKNOWN_ID);
        assert_eq!(vocabulary.capacity(), 10);
    }

    #[test]
    fn casing_is_configurable() {
        let tokenizer = TokenizerConfig {
            lowercase: false,
            ..TokenizerConfig::default()
        };
        let vocabulary = Vocabulary::build(["What a move"], 10, tokenizer);
        assert_ne!(vocabulary.id("What"), UNKNOWN_ID);
        assert_eq!(vocabulary.id("what"), UNKNOWN_ID);
    }

    #[test]
    fn filters_strip_punctuation() {
        let vocabulary = vocabulary(&[], 10);
        assert_eq!(
            vocabulary.split("Nf3!! (a great-move), isn't it?"),
            vec!["nf3", "a", "great", "move", "isn't", "it"]
        );
    }

    #[test]
    fn encode_wraps_and_decode_unwraps() {
        let vocabulary = vocabulary(&["a great move"], 10);
        let ids = vocabulary.encode("A terrible move");
        assert_eq!(ids.first(), Some(&START_ID));
        assert_eq!(ids.last(), Some(&END_ID));
        assert_eq!(ids[2], UNKNOWN_ID);

        let mut padded = ids.clone();
        padded.extend([PAD_ID, PAD_ID]);
        assert_eq!(vocabulary.decode(&padded), "a <unk> move");
    }

    #[test]
    fn persisted_vocabulary_reloads_identically() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        let vocabulary = vocabulary(&["What a great move", "A blunder", "great"], 3);

        vocabulary.save(&storage, "commentary/vocabulary.json").unwrap();
        let reloaded = Vocabulary::load(&storage, "commentary/vocabulary.json").unwrap();

        assert_eq!(reloaded, vocabulary);
        assert_eq!(reloaded.token(PAD_ID), Some(PAD_TOKEN));
        for token in vocabulary.tokens() {
            assert_eq!(reloaded.id(token), vocabulary.id(token));
        }
    }

    #[test]
    fn corrupt_vocabulary_rejected() {
        let json = br#"{"max_words": 2, "tokenizer": {"lowercase": true, "filters": ""},
            "tokens": ["<unk>", "<pad>", "<start>", "<end>"]}"#;
        assert!(matches!(
            Vocabulary::from_json(json),
            Err(VocabularyError::Corrupt(_))
        ));

        let json = br#"{"max_words": 1, "tokenizer": {"lowercase": true, "filters": ""},
            "tokens": ["<pad>", "<unk>", "<start>", "<end>", "a", "b"]}"#;
        assert!(matches!(
            Vocabulary::from_json(json),
            Err(VocabularyError::Corrupt(_))
        ));

        let json = br#"{"max_words": 18446744073709551615,
            "tokenizer": {"lowercase": true, "filters": ""},
            "tokens": ["<pad>", "<unk>", "<start>", "<end>"]}"#;
        assert!(matches!(
            Vocabulary::from_json(json),
            Err(VocabularyError::Corrupt(_))
        ));
    }

    #[test]
    fn capacity_saturates_for_huge_limits() {
        let vocabulary = vocabulary(&["a"], usize::MAX);
        assert_eq!(vocabulary.capacity(), usize::MAX);
        assert!(vocabulary.ensure_capacity(5004).is_err());
    }

    #[test]
    fn capacity_mismatch_is_fatal() {
        let vocabulary = vocabulary(&["a b c"], 100);
        assert!(vocabulary.ensure_capacity(104).is_ok());
        assert!(matches!(
            vocabulary.ensure_capacity(5001),
            Err(VocabularyError::SizeMismatch {
                expected: 5001,
                actual: 104
            })
        ));
    }

    #[test]
    fn corpus_file_builds_vocabulary() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        storage
            .save_file("comments.txt", b"Letting the Queen join the attack.\n\nFalling into the Lasker Trap.\n")
            .unwrap();

        let vocabulary =
            Vocabulary::build_from_storage(&storage, "comments.txt", 100, TokenizerConfig::default())
                .unwrap();
        assert_eq!(vocabulary.token(4), Some("the"));
        assert_ne!(vocabulary.id("lasker"), UNKNOWN_ID);
    }

    #[test]
    fn padding_and_shifting() {
        let padded = pad_sequences(&[vec![2, 5, 3], vec![2, 6, 7, 8, 3]], 4);
        assert_eq!(padded, vec![vec![2, 5, 3, 0], vec![2, 6, 7, 8]]);

        let (input, target) = shift_for_teacher_forcing(&[2, 5, 6, 3]);
        assert_eq!(input, vec![2, 5, 6]);
        assert_eq!(target, vec![5, 6, 3]);
    }
}
