use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use caption_core::{TrainConfigRecord, CONFIG_TRAIN_FILE};
use tokenizer::TextVectorizer;
use tracker::Run;

use crate::history::{History, HISTORY_FILE};
use crate::settings::Settings;
use crate::train::Trainer;

/// Paths written by [`save_all`], in write order.
#[derive(Debug, Clone)]
pub struct SavedArtifacts {
    pub history: PathBuf,
    pub weights: PathBuf,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
}

pub fn save_history(history: &History, save_dir: &Path) -> Result<PathBuf> {
    let path = save_dir.join(HISTORY_FILE);
    history.save(&path)?;
    Ok(path)
}

/// Writes the weights and mirrors them to the tracking run.
pub fn save_weights(trainer: &Trainer, save_dir: &Path, filename: &str, run: &mut Run) -> Result<PathBuf> {
    let path = save_dir.join(filename);
    trainer.save_weights(&path)?;
    run.save(&path)?;
    Ok(path)
}

pub fn save_config_train(record: &TrainConfigRecord, save_dir: &Path) -> Result<PathBuf> {
    let path = save_dir.join(CONFIG_TRAIN_FILE);
    record.save(&path)?;
    Ok(path)
}

pub fn save_tokenizer(vectorizer: &TextVectorizer, save_dir: &Path) -> Result<PathBuf> {
    Ok(vectorizer.save(save_dir)?)
}

/// Writes history, weights, training config and tokenizer under
/// `settings.save_dir`. A failure leaves the earlier files in place.
pub fn save_all(
    settings: &Settings,
    history: &History,
    trainer: &Trainer,
    vectorizer: &TextVectorizer,
    run: &mut Run,
) -> Result<SavedArtifacts> {
    let save_dir = settings.save_dir.as_path();
    fs::create_dir_all(save_dir).with_context(|| format!("Failed to create {:?}", save_dir))?;

    let history = save_history(history, save_dir)?;
    let weights = save_weights(trainer, save_dir, &settings.weights_filename, run)?;

    let record = TrainConfigRecord::new(
        &trainer.model().config,
        settings.max_vocab_size,
        settings.batch_size,
        settings.epochs,
    );
    let config = save_config_train(&record, save_dir)?;
    let tokenizer = save_tokenizer(vectorizer, save_dir)?;

    log::info!("Saved training artifacts to {:?}", save_dir);
    Ok(SavedArtifacts {
        history,
        weights,
        config,
        tokenizer,
    })
}
