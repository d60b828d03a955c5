pub mod error;
pub mod standardize;
pub mod vectorizer;
pub mod vocab;

pub use error::TokenizerError;
pub use standardize::standardize;
pub use vectorizer::{TextVectorizer, VectorizerConfig, TOKENIZER_FILE};
pub use vocab::{Vocab, PAD_ID, UNK_ID};
