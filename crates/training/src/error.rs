use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("{0}")]
    Configuration(String),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("state mismatch: {0}")]
    StateMismatch(String),
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, TrainingError>;

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn state_mismatch(message: impl Into<String>) -> Self {
        Self::StateMismatch(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
