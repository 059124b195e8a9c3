use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::ConfigError;

/// Side length of the board; every spatial tensor is `BOARD_SIDE x BOARD_SIDE`.
pub const BOARD_SIDE: usize = 8;
/// Number of squares, which is also the commentary encoder's sequence length.
pub const BOARD_SQUARES: usize = BOARD_SIDE * BOARD_SIDE;

/// Block strategy used for every architecture layer of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Conv2d,
    Attention,
    Augmented,
}

impl Architecture {
    pub const ALL: [Architecture; 3] = [
        Architecture::Conv2d,
        Architecture::Attention,
        Architecture::Augmented,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Conv2d => "conv2d",
            Architecture::Attention => "attention",
            Architecture::Augmented => "augmented",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|architecture| architecture.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownArchitecture(s.to_string()))
    }
}

/// Memory layout of spatial tensors at the model boundary.
///
/// The network computes channel-first internally; inputs and policy outputs
/// are converted at the edges when channel-last is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    #[default]
    ChannelsFirst,
    ChannelsLast,
}

impl DataFormat {
    /// Per-example shape of a spatial tensor with `channels` planes.
    pub fn spatial_shape(&self, channels: usize) -> [usize; 3] {
        match self {
            DataFormat::ChannelsFirst => [channels, BOARD_SIDE, BOARD_SIDE],
            DataFormat::ChannelsLast => [BOARD_SIDE, BOARD_SIDE, channels],
        }
    }
}

/// Architecture of the shared trunk and gameplay heads.
///
/// `architecture`, `filter_count` and `residual_count` have no defaults: a
/// config that omits them fails to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub filter_count: usize,
    pub residual_count: usize,
    #[serde(default = "default_input_planes_count")]
    pub input_planes_count: usize,
    #[serde(default = "default_output_planes_count")]
    pub output_planes_count: usize,
    #[serde(default = "default_attention_heads")]
    pub attention_heads: usize,
    #[serde(default = "default_dense_count")]
    pub dense_count: usize,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub data_format: DataFormat,
}

fn default_input_planes_count() -> usize {
    101
}

fn default_output_planes_count() -> usize {
    73
}

fn default_attention_heads() -> usize {
    8
}

fn default_dense_count() -> usize {
    256
}

fn default_weight_decay() -> f64 {
    1e-4
}

impl ModelConfig {
    pub fn new(architecture: Architecture, filter_count: usize, residual_count: usize) -> Self {
        Self {
            architecture,
            filter_count,
            residual_count,
            input_planes_count: default_input_planes_count(),
            output_planes_count: default_output_planes_count(),
            attention_heads: default_attention_heads(),
            dense_count: default_dense_count(),
            weight_decay: default_weight_decay(),
            data_format: DataFormat::default(),
        }
    }

    pub fn with_attention_heads(mut self, attention_heads: usize) -> Self {
        self.attention_heads = attention_heads;
        self
    }

    pub fn with_dense_count(mut self, dense_count: usize) -> Self {
        self.dense_count = dense_count;
        self
    }

    pub fn with_data_format(mut self, data_format: DataFormat) -> Self {
        self.data_format = data_format;
        self
    }

    /// Checks every structural value before any weights are allocated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("filter_count", self.filter_count),
            ("input_planes_count", self.input_planes_count),
            ("output_planes_count", self.output_planes_count),
            ("attention_heads", self.attention_heads),
            ("dense_count", self.dense_count),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.weight_decay.is_nan() || self.weight_decay < 0.0 {
            return Err(ConfigError::invalid(
                "weight_decay",
                format!("must be non-negative, got {}", self.weight_decay),
            ));
        }

        // Attention splits its depth across heads; augmented runs it at half width.
        let attention_depth = match self.architecture {
            Architecture::Conv2d => return Ok(()),
            Architecture::Attention => self.filter_count,
            Architecture::Augmented => {
                if self.filter_count % 2 != 0 {
                    return Err(ConfigError::invalid(
                        "filter_count",
                        format!(
                            "augmented layers split {} filters in half",
                            self.filter_count
                        ),
                    ));
                }
                self.filter_count / 2
            }
        };
        if attention_depth % self.attention_heads != 0 {
            return Err(ConfigError::invalid(
                "attention_heads",
                format!(
                    "attention depth {attention_depth} is not divisible by {} heads",
                    self.attention_heads
                ),
            ));
        }
        Ok(())
    }
}

/// Text normalisation applied before splitting comments into tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default = "default_lowercase")]
    pub lowercase: bool,
    /// Characters replaced by whitespace before splitting.
    #[serde(default = "default_filters")]
    pub filters: String,
}

fn default_lowercase() -> bool {
    true
}

fn default_filters() -> String {
    "!\"#$%&()*+.,-/:;=?@[\\]^_`{|}~\t\n".to_string()
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            lowercase: default_lowercase(),
            filters: default_filters(),
        }
    }
}

/// Commentary decoder and vocabulary settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentaryConfig {
    pub transformer_layers: usize,
    pub transformer_filters: usize,
    pub transformer_heads: usize,
    pub transformer_feedforward: usize,
    pub transformer_dropout_rate: f64,
    /// Maximum number of corpus-derived tokens kept in the vocabulary.
    pub transformer_num_words: usize,
    pub transformer_max_length: usize,
    /// Logical path of the newline-separated comment corpus.
    pub corpus_path: String,
    /// Logical path of the persisted vocabulary.
    pub vocabulary_path: String,
    pub tokenizer: TokenizerConfig,
}

impl Default for CommentaryConfig {
    fn default() -> Self {
        Self {
            transformer_layers: 4,
            transformer_filters: 128,
            transformer_heads: 8,
            transformer_feedforward: 512,
            transformer_dropout_rate: 0.1,
            transformer_num_words: 5000,
            transformer_max_length: 128,
            corpus_path: "commentary/training/comments.txt".to_string(),
            vocabulary_path: "commentary/vocabulary.json".to_string(),
            tokenizer: TokenizerConfig::default(),
        }
    }
}

impl CommentaryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("transformer_layers", self.transformer_layers),
            ("transformer_filters", self.transformer_filters),
            ("transformer_heads", self.transformer_heads),
            ("transformer_feedforward", self.transformer_feedforward),
            ("transformer_max_length", self.transformer_max_length),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.transformer_filters % self.transformer_heads != 0 {
            return Err(ConfigError::invalid(
                "transformer_heads",
                format!(
                    "{} filters are not divisible by {} heads",
                    self.transformer_filters, self.transformer_heads
                ),
            ));
        }
        if !(0.0..1.0).contains(&self.transformer_dropout_rate) {
            return Err(ConfigError::invalid(
                "transformer_dropout_rate",
                format!("must be in [0, 1), got {}", self.transformer_dropout_rate),
            ));
        }
        Ok(())
    }
}

/// Resolved configuration for one named network.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub network_name: String,
    pub model: ModelConfig,
    pub commentary: CommentaryConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses a config document.
    ///
    /// Top-level `[model]` and `[commentary]` tables hold defaults; the
    /// `[[networks]]` entry named by `network.network_name` may override any
    /// key of either section.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let root: toml::Table = toml::from_str(text)?;

        let network_name = root
            .get("network")
            .and_then(|network| network.get("network_name"))
            .and_then(|name| name.as_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ConfigError::invalid("network.network_name", "missing"))?
            .to_string();

        let network = root
            .get("networks")
            .and_then(|networks| networks.as_array())
            .and_then(|networks| {
                networks.iter().find(|network| {
                    network.get("name").and_then(|name| name.as_str()) == Some(&network_name)
                })
            })
            .ok_or_else(|| ConfigError::UnknownNetwork(network_name.clone()))?;

        let model: ModelConfig = merged_section(&root, network, "model").try_into()?;
        let commentary: CommentaryConfig =
            merged_section(&root, network, "commentary").try_into()?;
        model.validate()?;
        commentary.validate()?;

        tracing::debug!(
            "Loaded config for network {}: architecture={}, filters={}, residuals={}",
            network_name,
            model.architecture,
            model.filter_count,
            model.residual_count
        );

        Ok(Self {
            network_name,
            model,
            commentary,
        })
    }
}

fn merged_section(root: &toml::Table, network: &toml::Value, section: &str) -> toml::Value {
    let mut merged = root
        .get(section)
        .and_then(|defaults| defaults.as_table())
        .cloned()
        .unwrap_or_default();
    if let Some(overrides) = network.get(section).and_then(|o| o.as_table()) {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    toml::Value::Table(merged)
}
