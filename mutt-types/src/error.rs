use thiserror::Error;

/// Errors produced while building or validating pipeline data types.
#[derive(Error, Debug)]
pub enum MuttError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MuttError>;
