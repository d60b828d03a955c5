use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tch::Device;

use caption_core::safetensors_util::load_safetensors;
use caption_core::{load_image, ImageCaptioningModel, TrainConfigRecord, CONFIG_TRAIN_FILE};
use tokenizer::{TextVectorizer, TOKENIZER_FILE};

pub const START_TOKEN: &str = "<start>";
pub const END_TOKEN: &str = "<end>";

/// A trained captioning model together with its tokenizer.
pub struct Captioner {
    model: ImageCaptioningModel,
    // Owns the model parameters.
    _vs: tch::nn::VarStore,
    vectorizer: TextVectorizer,
    start_id: i64,
    end_id: i64,
    device: Device,
}

impl Captioner {
    pub fn config(&self) -> &caption_core::ModelConfig {
        &self.model.config
    }

    /// Greedy caption for the image at `path`, without start/end markers.
    pub fn caption<P: AsRef<Path>>(&self, path: P) -> Result<String> {
        let path = path.as_ref();
        let image = load_image(path, self.model.config.image_size)?.to_device(self.device);
        let ids = self.model.generate(&image, self.start_id, self.end_id);
        tracing::debug!("Generated {} tokens for {:?}", ids.len(), path);

        let ids: Vec<u32> = ids.into_iter().map(|id| id as u32).collect();
        Ok(self.vectorizer.decode(&ids)?)
    }
}

/// Finds the weights file of a training directory: the single
/// `.safetensors` file it contains.
fn find_weights(dir: &Path) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == "safetensors"))
        .collect();
    candidates.sort();
    match candidates.len() {
        0 => bail!("No .safetensors weights found in {:?}", dir),
        1 => Ok(candidates.remove(0)),
        _ => bail!("Several weight files in {:?}; pass one explicitly", dir),
    }
}

/// Loads a captioner from a training output directory (`config_train.json`,
/// `tokenizer.json` and the weights). `weights` overrides the weights file.
pub fn load_captioner(save_dir: &Path, weights: Option<&Path>, device: Device) -> Result<Captioner> {
    let record = TrainConfigRecord::load(save_dir.join(CONFIG_TRAIN_FILE))?;
    let config = record.model_config();

    let vectorizer = TextVectorizer::load(save_dir.join(TOKENIZER_FILE))
        .with_context(|| format!("Failed to load tokenizer from {:?}", save_dir))?;
    let vocab_size = vectorizer.vocab_size()?;
    if vocab_size as i64 != config.vocab_size {
        bail!(
            "Tokenizer has {} tokens but the model was trained with {}",
            vocab_size,
            config.vocab_size
        );
    }
    let start_id = vectorizer
        .token_id(START_TOKEN)?
        .with_context(|| format!("Tokenizer has no {} token", START_TOKEN))? as i64;
    let end_id = vectorizer
        .token_id(END_TOKEN)?
        .with_context(|| format!("Tokenizer has no {} token", END_TOKEN))? as i64;

    let weights = match weights {
        Some(path) => path.to_path_buf(),
        None => find_weights(save_dir)?,
    };

    let mut vs = tch::nn::VarStore::new(device);
    let model = ImageCaptioningModel::new(&vs.root(), &config);
    let loaded = load_safetensors(&mut vs, &weights).context("Failed to load safetensors weights")?;
    tracing::info!("Loaded {} tensors from {:?}", loaded, weights);

    Ok(Captioner {
        model,
        _vs: vs,
        vectorizer,
        start_id,
        end_id,
        device,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use caption_core::safetensors_util::save_safetensors;
    use tch::{Kind, Tensor};

    fn write_training_dir(dir: &Path) {
        let mut vectorizer = TextVectorizer::new(50, 6).unwrap();
        vectorizer
            .adapt(&["<start> a cat on a mat <end>", "<start> a dog <end>"])
            .unwrap();
        vectorizer.save(dir).unwrap();

        let config = caption_core::ModelConfig {
            image_size: (16, 16),
            embed_dim: 8,
            ff_dim: 16,
            num_heads: 2,
            seq_length: 6,
            vocab_size: vectorizer.vocab_size().unwrap() as i64,
            cnn_channels: vec![4, 8],
            ..Default::default()
        };
        TrainConfigRecord::new(&config, 50, 2, 1)
            .save(dir.join(CONFIG_TRAIN_FILE))
            .unwrap();

        let vs = tch::nn::VarStore::new(Device::Cpu);
        let _model = ImageCaptioningModel::new(&vs.root(), &config);
        save_safetensors(&vs, dir.join("model.safetensors")).unwrap();
    }

    #[test]
    fn captions_an_image_from_a_training_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_training_dir(dir.path());

        let image = dir.path().join("img.png");
        let pixels = (Tensor::rand([3, 20, 20], (Kind::Float, Device::Cpu)) * 255.0).to_kind(Kind::Uint8);
        tch::vision::image::save(&pixels, &image).unwrap();

        let captioner = load_captioner(dir.path(), None, Device::Cpu).unwrap();
        let caption = captioner.caption(&image).unwrap();
        assert!(!caption.contains(END_TOKEN));
        assert!(caption.split_whitespace().count() < 6);
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_captioner(dir.path(), None, Device::Cpu).is_err());
    }

    #[test]
    fn ambiguous_weights_need_an_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        write_training_dir(dir.path());
        std::fs::copy(dir.path().join("model.safetensors"), dir.path().join("other.safetensors")).unwrap();

        assert!(load_captioner(dir.path(), None, Device::Cpu).is_err());
        let explicit = dir.path().join("other.safetensors");
        assert!(load_captioner(dir.path(), Some(&explicit), Device::Cpu).is_ok());
    }
}
