use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Authentication failed: API key is empty")]
    EmptyApiKey,

    #[error("Invalid identifier {0:?}: only letters, digits, '-' and '_' are allowed")]
    InvalidName(String),

    #[error("Artifact is not a file: {0}")]
    NotAFile(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
