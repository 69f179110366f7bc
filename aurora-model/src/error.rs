use thiserror::Error;

/// Errors produced while decoding or validating model payloads.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ModelError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
