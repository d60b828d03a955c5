use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TokenizerError};

pub const PAD_TOKEN: &str = "";
pub const UNK_TOKEN: &str = "[UNK]";
pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;

/// Ordered vocabulary. Index 0 is padding, index 1 the out-of-vocabulary token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Vocab {
    id_to_token: Vec<String>,
    token_to_id: HashMap<String, u32>,
}

impl Vocab {
    /// Vocabulary holding only the two reserved tokens.
    pub fn new() -> Self {
        let mut vocab = Self {
            id_to_token: Vec::new(),
            token_to_id: HashMap::new(),
        };
        vocab.push(PAD_TOKEN.to_string());
        vocab.push(UNK_TOKEN.to_string());
        vocab
    }

    /// Appends `token` unless it is already present. Returns its id.
    pub fn push(&mut self, token: String) -> u32 {
        if let Some(id) = self.token_to_id.get(&token) {
            return *id;
        }
        let id = self.id_to_token.len() as u32;
        self.token_to_id.insert(token.clone(), id);
        self.id_to_token.push(token);
        id
    }

    pub fn get_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn get_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    pub fn tokens(&self) -> &[String] {
        &self.id_to_token
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Vec<String>> for Vocab {
    type Error = TokenizerError;

    fn try_from(tokens: Vec<String>) -> Result<Self> {
        if tokens.len() < 2 || tokens[0] != PAD_TOKEN || tokens[1] != UNK_TOKEN {
            return Err(TokenizerError::VocabMismatch);
        }
        let mut vocab = Self {
            id_to_token: Vec::with_capacity(tokens.len()),
            token_to_id: HashMap::with_capacity(tokens.len()),
        };
        for token in tokens {
            let expected = vocab.len();
            if vocab.push(token) as usize != expected {
                return Err(TokenizerError::VocabMismatch);
            }
        }
        Ok(vocab)
    }
}

impl From<Vocab> for Vec<String> {
    fn from(vocab: Vocab) -> Self {
        vocab.id_to_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tokens_come_first() {
        let vocab = Vocab::new();
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.get_id(PAD_TOKEN), Some(PAD_ID));
        assert_eq!(vocab.get_id(UNK_TOKEN), Some(UNK_ID));
    }

    #[test]
    fn push_is_idempotent() {
        let mut vocab = Vocab::new();
        let a = vocab.push("cat".into());
        let b = vocab.push("cat".into());
        assert_eq!(a, b);
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.get_token(a), Some("cat"));
    }

    #[test]
    fn rejects_list_without_reserved_prefix() {
        let err = Vocab::try_from(vec!["cat".to_string(), "dog".to_string()]);
        assert!(matches!(err, Err(TokenizerError::VocabMismatch)));
    }

    #[test]
    fn rejects_duplicate_tokens() {
        let tokens = vec!["".into(), "[UNK]".into(), "a".into(), "a".into()];
        assert!(Vocab::try_from(tokens).is_err());
    }
}
