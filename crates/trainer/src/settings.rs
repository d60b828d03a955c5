use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use caption_core::ModelConfig;

pub const DEFAULT_CONFIG_PATH: &str = "configs/train_config.yaml";
pub const CONFIG_ENV_VAR: &str = "CAPTION_TRAIN_CONFIG";

/// Every knob of a training run. Fixed before training starts and passed
/// explicitly to each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub train_data_json_path: PathBuf,
    pub valid_data_json_path: PathBuf,
    pub text_data_json_path: PathBuf,
    pub save_dir: PathBuf,
    pub weights_filename: String,

    pub api_key_path: PathBuf,
    pub tracking_dir: PathBuf,
    pub project: String,
    pub entity: String,

    /// (height, width)
    pub image_size: (i64, i64),
    pub max_vocab_size: usize,
    pub seq_length: usize,
    pub embed_dim: i64,
    pub num_heads: i64,
    pub ff_dim: i64,
    pub cnn_channels: Vec<i64>,
    /// Optional pretrained backbone weights (safetensors). Loading them freezes the CNN.
    pub cnn_weights: Option<PathBuf>,

    pub batch_size: usize,
    pub epochs: usize,
    pub captions_per_image: usize,
    pub shuffle: bool,
    pub warmup_steps: usize,
    pub early_stopping_patience: usize,
    /// Minimum decrease of the monitored loss that counts as an improvement.
    pub early_stopping_min_delta: f64,
    /// Put the best epoch's weights back once training ends.
    pub restore_best_weights: bool,
    pub seed: Option<u64>,

    pub reduce_dataset: bool,
    pub num_train_img: usize,
    pub num_valid_img: usize,
    /// Fraction of the validation mapping kept for validation; the rest becomes the test set.
    pub valid_test_ratio: f64,

    pub train_set_aug: bool,
    pub valid_set_aug: bool,
    pub test_set: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            train_data_json_path: PathBuf::from("COCO_dataset/captions_mapping_train.json"),
            valid_data_json_path: PathBuf::from("COCO_dataset/captions_mapping_valid.json"),
            text_data_json_path: PathBuf::from("COCO_dataset/text_data.json"),
            save_dir: PathBuf::from("save_train_dir"),
            weights_filename: "big_model_weights_coco.safetensors".to_string(),

            api_key_path: PathBuf::from("apikey.txt"),
            tracking_dir: PathBuf::from("tracking"),
            project: "image-labeling-project".to_string(),
            entity: "dulcich".to_string(),

            image_size: (299, 299),
            max_vocab_size: 2_000_000,
            seq_length: 25,
            embed_dim: 512,
            num_heads: 6,
            ff_dim: 1024,
            cnn_channels: vec![32, 64, 128, 256, 512],
            cnn_weights: None,

            batch_size: 64,
            epochs: 14,
            captions_per_image: 5,
            shuffle: true,
            warmup_steps: 4000,
            early_stopping_patience: 3,
            early_stopping_min_delta: 0.0,
            restore_best_weights: true,
            seed: None,

            reduce_dataset: false,
            num_train_img: 68_363,
            num_valid_img: 20_000,
            valid_test_ratio: 0.6,

            train_set_aug: true,
            valid_set_aug: false,
            test_set: true,
        }
    }
}

impl Settings {
    /// Loads settings from `$CAPTION_TRAIN_CONFIG`, else `configs/train_config.yaml`,
    /// else the built-in defaults.
    pub fn load() -> Result<Self> {
        let settings = match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_yaml_file(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read training config {:?}", path))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse training config {:?}", path))?;
        log::info!("Loaded training config from {:?}", path);
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.valid_test_ratio) {
            bail!("valid_test_ratio must lie in [0, 1], got {}", self.valid_test_ratio);
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.epochs == 0 {
            bail!("epochs must be positive");
        }
        if self.seq_length < 2 {
            bail!("seq_length must be at least 2, got {}", self.seq_length);
        }
        if self.max_vocab_size < 2 {
            bail!("max_vocab_size must be at least 2, got {}", self.max_vocab_size);
        }
        if self.captions_per_image == 0 {
            bail!("captions_per_image must be positive");
        }
        if self.embed_dim <= 0 || self.num_heads <= 0 || self.ff_dim <= 0 {
            bail!("embed_dim, num_heads and ff_dim must be positive");
        }
        if !(self.early_stopping_min_delta >= 0.0) {
            bail!(
                "early_stopping_min_delta must be non-negative, got {}",
                self.early_stopping_min_delta
            );
        }
        if self.image_size.0 <= 0 || self.image_size.1 <= 0 {
            bail!("image_size must be positive, got {:?}", self.image_size);
        }
        Ok(())
    }

    /// Model hyperparameters once the vocabulary size is known.
    pub fn model_config(&self, vocab_size: usize) -> ModelConfig {
        ModelConfig {
            image_size: self.image_size,
            embed_dim: self.embed_dim,
            ff_dim: self.ff_dim,
            num_heads: self.num_heads,
            seq_length: self.seq_length as i64,
            vocab_size: vocab_size as i64,
            cnn_channels: self.cnn_channels.clone(),
            ..Default::default()
        }
    }
}
