use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokenizer has not been adapted to a corpus yet")]
    NotAdapted,

    #[error("Tokenizer was already adapted; vocabulary is frozen")]
    AlreadyAdapted,

    #[error("Invalid tokenizer settings: {0}")]
    InvalidSettings(String),

    #[error("Vocabulary mismatch")]
    VocabMismatch,
}

pub type Result<T> = std::result::Result<T, TokenizerError>;
