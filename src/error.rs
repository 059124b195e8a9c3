use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Network \"{0}\" is not listed under [[networks]]")]
    UnknownNetwork(String),
    #[error("Unknown architecture \"{0}\", expected one of: conv2d, attention, augmented")]
    UnknownArchitecture(String),
    #[error("Unknown sub-graph view \"{0}\", expected one of: play, commentary_encoder")]
    UnknownView(String),
    #[error("Invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Vocabulary construction, persistence and compatibility errors.
#[derive(Error, Debug)]
pub enum VocabularyError {
    #[error("Failed to access vocabulary storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize vocabulary: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt vocabulary: {0}")]
    Corrupt(String),
    #[error("Vocabulary capacity {actual} does not match decoder vocabulary size {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Errors raised while building, saving or loading networks.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
    #[error("Failed to record model: {0}")]
    Record(#[from] burn::record::RecorderError),
    #[error("Shape mismatch in {component}: expected width {expected}, got {actual}")]
    ShapeMismatch {
        component: &'static str,
        expected: usize,
        actual: usize,
    },
}
