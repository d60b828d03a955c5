use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::error::{Result, TokenizerError};
use crate::standardize::{split_unigrams, standardize};
use crate::vocab::{Vocab, PAD_ID, UNK_ID};

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Settings fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorizerConfig {
    /// Upper bound on the vocabulary size, reserved tokens included.
    pub max_tokens: usize,
    /// Every encoded sequence is padded or truncated to this length.
    pub sequence_length: usize,
    pub ngrams: usize,
}

/// Maps caption strings to fixed-length integer sequences.
///
/// The vocabulary is learned once by [`TextVectorizer::adapt`] and frozen
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextVectorizer {
    config: VectorizerConfig,
    vocabulary: Option<Vocab>,
}

impl TextVectorizer {
    pub fn new(max_tokens: usize, sequence_length: usize) -> Result<Self> {
        if max_tokens < 2 {
            return Err(TokenizerError::InvalidSettings(format!(
                "max_tokens must leave room for the 2 reserved tokens, got {}",
                max_tokens
            )));
        }
        if sequence_length == 0 {
            return Err(TokenizerError::InvalidSettings(
                "sequence_length must be positive".to_string(),
            ));
        }
        Ok(Self {
            config: VectorizerConfig {
                max_tokens,
                sequence_length,
                ngrams: 1,
            },
            vocabulary: None,
        })
    }

    pub fn config(&self) -> &VectorizerConfig {
        &self.config
    }

    pub fn is_adapted(&self) -> bool {
        self.vocabulary.is_some()
    }

    /// Learns the vocabulary from `corpus`. Tokens are ranked by frequency,
    /// ties broken lexicographically.
    pub fn adapt<S: AsRef<str> + Sync>(&mut self, corpus: &[S]) -> Result<()> {
        if self.vocabulary.is_some() {
            return Err(TokenizerError::AlreadyAdapted);
        }

        let counts = corpus
            .par_iter()
            .fold(HashMap::<String, u64>::new, |mut acc, text| {
                let text = standardize(text.as_ref());
                for token in split_unigrams(&text) {
                    *acc.entry(token.to_string()).or_insert(0) += 1;
                }
                acc
            })
            .reduce(HashMap::new, |mut a, b| {
                for (token, count) in b {
                    *a.entry(token).or_insert(0) += count;
                }
                a
            });

        let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut vocab = Vocab::new();
        for (token, _) in ranked {
            if vocab.len() >= self.config.max_tokens {
                break;
            }
            vocab.push(token);
        }

        log::debug!(
            "Adapted tokenizer: {} tokens (max {})",
            vocab.len(),
            self.config.max_tokens
        );
        self.vocabulary = Some(vocab);
        Ok(())
    }

    pub fn vocab(&self) -> Result<&Vocab> {
        self.vocabulary.as_ref().ok_or(TokenizerError::NotAdapted)
    }

    /// Vocabulary size, reserved tokens included.
    pub fn vocab_size(&self) -> Result<usize> {
        Ok(self.vocab()?.len())
    }

    pub fn token_id(&self, token: &str) -> Result<Option<u32>> {
        Ok(self.vocab()?.get_id(token))
    }

    /// Encodes `text` into exactly `sequence_length` ids.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let vocab = self.vocab()?;
        let len = self.config.sequence_length;

        let text = standardize(text);
        let mut ids: Vec<u32> = split_unigrams(&text)
            .take(len)
            .map(|token| vocab.get_id(token).unwrap_or(UNK_ID))
            .collect();
        ids.resize(len, PAD_ID);
        Ok(ids)
    }

    pub fn encode_batch<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Result<Vec<Vec<u32>>> {
        texts.par_iter().map(|t| self.encode(t.as_ref())).collect()
    }

    /// Joins the tokens for `ids`, skipping padding.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let vocab = self.vocab()?;
        let tokens: Vec<&str> = ids
            .iter()
            .filter(|&&id| id != PAD_ID)
            .filter_map(|&id| vocab.get_token(id))
            .collect();
        Ok(tokens.join(" "))
    }

    /// Writes `tokenizer.json` under `dir` and returns its path.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        if self.vocabulary.is_none() {
            return Err(TokenizerError::NotAdapted);
        }
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(TOKENIZER_FILE);
        let file = File::create(&path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let tokenizer: TextVectorizer = serde_json::from_reader(reader)?;
        if let Some(vocab) = &tokenizer.vocabulary {
            if vocab.len() > tokenizer.config.max_tokens {
                return Err(TokenizerError::VocabMismatch);
            }
        }
        Ok(tokenizer)
    }
}
