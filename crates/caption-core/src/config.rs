use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_TRAIN_FILE: &str = "config_train.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input image resolution as (height, width).
    pub image_size: (i64, i64),
    /// Width of the visual features and token embeddings.
    pub embed_dim: i64,
    /// Hidden width of the feed-forward layers.
    pub ff_dim: i64,
    /// Number of attention heads. Each head projects to `embed_dim`.
    pub num_heads: i64,
    /// Length of a tokenized caption, including start/end markers.
    pub seq_length: i64,
    /// Size of the vocabulary (decoder output dimension).
    pub vocab_size: i64,
    /// Output channels of each stride-2 stage of the CNN feature extractor.
    pub cnn_channels: Vec<i64>,
    /// Dropout inside the attention layers.
    pub attention_dropout: f64,
    /// Dropout after the decoder feed-forward hidden layer.
    pub ffn_dropout: f64,
    /// Dropout before the vocabulary projection.
    pub output_dropout: f64,
    pub layer_norm_epsilon: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: (299, 299),
            embed_dim: 512,
            ff_dim: 1024,
            num_heads: 6,
            seq_length: 25,
            vocab_size: 2,
            cnn_channels: vec![32, 64, 128, 256, 512],
            attention_dropout: 0.1,
            ffn_dropout: 0.3,
            output_dropout: 0.5,
            layer_norm_epsilon: 1e-6,
        }
    }
}

impl ModelConfig {
    /// Spatial positions produced by the feature extractor for one image.
    pub fn num_patches(&self) -> i64 {
        let (mut h, mut w) = self.image_size;
        for _ in &self.cnn_channels {
            h = (h - 1) / 2 + 1;
            w = (w - 1) / 2 + 1;
        }
        h * w
    }
}

/// Flat hyperparameter record persisted next to the weights as
/// `config_train.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TrainConfigRecord {
    /// [height, width]
    pub image_size: [i64; 2],
    pub max_vocab_size: usize,
    pub seq_length: i64,
    pub embed_dim: i64,
    pub num_heads: i64,
    pub ff_dim: i64,
    pub batch_size: usize,
    pub epochs: usize,
    pub vocab_size: i64,
    #[serde(default = "default_cnn_channels")]
    pub cnn_channels: Vec<i64>,
}

fn default_cnn_channels() -> Vec<i64> {
    ModelConfig::default().cnn_channels
}

impl TrainConfigRecord {
    pub fn new(model: &ModelConfig, max_vocab_size: usize, batch_size: usize, epochs: usize) -> Self {
        Self {
            image_size: [model.image_size.0, model.image_size.1],
            max_vocab_size,
            seq_length: model.seq_length,
            embed_dim: model.embed_dim,
            num_heads: model.num_heads,
            ff_dim: model.ff_dim,
            batch_size,
            epochs,
            vocab_size: model.vocab_size,
            cnn_channels: model.cnn_channels.clone(),
        }
    }

    /// Rebuilds the architecture the record describes, with default dropout rates.
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            image_size: (self.image_size[0], self.image_size[1]),
            embed_dim: self.embed_dim,
            ff_dim: self.ff_dim,
            num_heads: self.num_heads,
            seq_length: self.seq_length,
            vocab_size: self.vocab_size,
            cnn_channels: self.cnn_channels.clone(),
            ..Default::default()
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}
