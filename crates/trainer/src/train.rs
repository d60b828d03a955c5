use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tch::{nn, nn::OptimizerConfig, Device, Tensor};

use caption_core::safetensors_util::{load_safetensors_with_prefix, restore, save_safetensors, snapshot};
use caption_core::{ImageCaptioningModel, ModelConfig, CNN_PREFIX};
use tracker::{Metrics, Run};

use crate::dataset::{CaptionBatch, CaptionDataset};
use crate::early_stopping::{EarlyStopping, StopDecision};
use crate::history::{
    History, BATCH_TRAIN_ACCURACY, BATCH_TRAIN_LOSS, EPOCH_TRAIN_ACCURACY, EPOCH_TRAIN_LOSS, EPOCH_VALID_ACCURACY,
    EPOCH_VALID_LOSS,
};
use crate::schedule::WarmupDecaySchedule;
use crate::settings::Settings;

/// Loss and accuracy of a full pass over a dataset, weighted by sample count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

pub(crate) fn metrics(pairs: &[(&str, f64)]) -> Metrics {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub struct Trainer {
    model: ImageCaptioningModel,
    vs: nn::VarStore,
    optimizer: nn::Optimizer,
    schedule: WarmupDecaySchedule,
    device: Device,
    global_step: u64,
    rng: StdRng,
    batch_size: usize,
    epochs: usize,
    shuffle: bool,
    early_stopping: EarlyStopping,
    best_epoch: Option<usize>,
}

impl Trainer {
    pub fn new(model_config: ModelConfig, settings: &Settings, device: Device) -> Result<Self> {
        let rng = match settings.seed {
            Some(seed) => {
                tch::manual_seed(seed as i64);
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };

        let mut vs = nn::VarStore::new(device);
        let mut model = ImageCaptioningModel::new(&vs.root(), &model_config);

        if let Some(path) = &settings.cnn_weights {
            let loaded = load_safetensors_with_prefix(&mut vs, path, CNN_PREFIX)?;
            if loaded == 0 {
                bail!("No CNN tensors (prefix {:?}) found in {:?}", CNN_PREFIX, path);
            }
            println!("Loaded {} pretrained CNN tensors from {:?}", loaded, path);
            model.freeze_cnn(&vs);
        }

        let mut early_stopping = EarlyStopping::new(settings.early_stopping_patience, settings.early_stopping_min_delta);
        if settings.restore_best_weights {
            early_stopping = early_stopping.with_restore_best();
        }

        let schedule = WarmupDecaySchedule::new(model_config.embed_dim, settings.warmup_steps);
        let optimizer = nn::Adam {
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-9,
            ..Default::default()
        }
        .build(&vs, schedule.lr(1))?;

        log::info!(
            "Model ready: {} trainable parameters, vocab size {}, CNN frozen: {}",
            ImageCaptioningModel::parameter_count(&vs),
            model_config.vocab_size,
            model.cnn_frozen()
        );

        Ok(Self {
            model,
            vs,
            optimizer,
            schedule,
            device,
            global_step: 0,
            rng,
            batch_size: settings.batch_size,
            epochs: settings.epochs,
            shuffle: settings.shuffle,
            early_stopping,
            best_epoch: None,
        })
    }

    pub fn model(&self) -> &ImageCaptioningModel {
        &self.model
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Zero-based epoch with the lowest monitored loss in the last `fit`.
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// One optimizer step per caption slot. Returns the mean loss and
    /// accuracy over the slots.
    pub fn train_batch(&mut self, batch: &CaptionBatch) -> Result<(f64, f64)> {
        let slots = batch.captions.size()[1];
        if slots == 0 {
            bail!("Batch has no caption slots");
        }

        let frozen_features = self
            .model
            .cnn_frozen()
            .then(|| self.model.image_features(&batch.images, true));

        let mut loss_sum = 0.0;
        let mut accuracy_sum = 0.0;
        for slot in 0..slots {
            self.global_step += 1;
            self.optimizer.set_lr(self.schedule.lr(self.global_step));

            let features = match &frozen_features {
                Some(features) => features.shallow_clone(),
                None => self.model.image_features(&batch.images, true),
            };
            let sequences = batch.captions.select(1, slot);
            let step = self.model.caption_step(&features, &sequences, true);
            self.optimizer.backward_step(&step.loss);

            loss_sum += step.loss.double_value(&[]);
            accuracy_sum += step.accuracy;
        }

        Ok((loss_sum / slots as f64, accuracy_sum / slots as f64))
    }

    /// Forward-only pass over `dataset`.
    pub fn evaluate(&mut self, dataset: &CaptionDataset) -> Result<EvalMetrics> {
        if dataset.is_empty() {
            bail!("Cannot evaluate an empty dataset");
        }
        let _guard = tch::no_grad_guard();

        let mut loss_sum = 0.0;
        let mut accuracy_sum = 0.0;
        let mut seen = 0.0;
        for batch in dataset.batches(self.batch_size, false, &mut self.rng) {
            let batch = batch?;
            let (loss, accuracy) = self.eval_batch(&batch);
            let n = batch.size() as f64;
            loss_sum += loss * n;
            accuracy_sum += accuracy * n;
            seen += n;
        }

        Ok(EvalMetrics {
            loss: loss_sum / seen,
            accuracy: accuracy_sum / seen,
        })
    }

    fn eval_batch(&self, batch: &CaptionBatch) -> (f64, f64) {
        let slots = batch.captions.size()[1];
        let features = self.model.image_features(&batch.images, false);

        let mut loss_sum = 0.0;
        let mut accuracy_sum = 0.0;
        for slot in 0..slots {
            let step = self
                .model
                .caption_step(&features, &batch.captions.select(1, slot), false);
            loss_sum += step.loss.double_value(&[]);
            accuracy_sum += step.accuracy;
        }
        (loss_sum / slots as f64, accuracy_sum / slots as f64)
    }

    /// Trains for at most `epochs` epochs with early stopping on the
    /// validation loss (train loss when `valid` is empty). The best weights
    /// are restored before returning.
    pub fn fit(&mut self, train: &CaptionDataset, valid: &CaptionDataset, run: &mut Run) -> Result<History> {
        if train.is_empty() {
            bail!("Training dataset is empty");
        }

        let mut history = History::new();
        let mut early_stopping = self.early_stopping.clone();
        let mut best_weights: Option<Vec<(String, Tensor)>> = None;
        let num_batches = train.num_batches(self.batch_size);

        println!(
            "Starting training: {} epochs, {} batches per epoch, {} captions per image",
            self.epochs,
            num_batches,
            train.captions_per_image()
        );

        for epoch in 0..self.epochs {
            let mut loss_sum = 0.0;
            let mut accuracy_sum = 0.0;
            let mut seen = 0.0;

            let batches = train.batches(self.batch_size, self.shuffle, &mut self.rng);
            for (batch_idx, batch) in batches.enumerate() {
                let batch = batch?;
                let (loss, accuracy) = self.train_batch(&batch)?;
                run.log(&metrics(&[(BATCH_TRAIN_LOSS, loss), (BATCH_TRAIN_ACCURACY, accuracy)]))?;

                let n = batch.size() as f64;
                loss_sum += loss * n;
                accuracy_sum += accuracy * n;
                seen += n;

                if batch_idx % 10 == 0 {
                    println!(
                        "Epoch {} | Batch {}/{} | Loss: {:.4} | Acc: {:.4} | LR: {:.2e}",
                        epoch + 1,
                        batch_idx + 1,
                        num_batches,
                        loss,
                        accuracy,
                        self.schedule.lr(self.global_step)
                    );
                }
            }

            let train_metrics = EvalMetrics {
                loss: loss_sum / seen,
                accuracy: accuracy_sum / seen,
            };
            history.push(EPOCH_TRAIN_LOSS, train_metrics.loss);
            history.push(EPOCH_TRAIN_ACCURACY, train_metrics.accuracy);
            let mut epoch_log = vec![
                (EPOCH_TRAIN_LOSS, train_metrics.loss),
                (EPOCH_TRAIN_ACCURACY, train_metrics.accuracy),
            ];

            let monitored = if valid.is_empty() {
                println!(
                    "Epoch {}/{} - loss: {:.4} - accuracy: {:.4}",
                    epoch + 1,
                    self.epochs,
                    train_metrics.loss,
                    train_metrics.accuracy
                );
                train_metrics.loss
            } else {
                let valid_metrics = self.evaluate(valid)?;
                history.push(EPOCH_VALID_LOSS, valid_metrics.loss);
                history.push(EPOCH_VALID_ACCURACY, valid_metrics.accuracy);
                epoch_log.push((EPOCH_VALID_LOSS, valid_metrics.loss));
                epoch_log.push((EPOCH_VALID_ACCURACY, valid_metrics.accuracy));
                println!(
                    "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
                    epoch + 1,
                    self.epochs,
                    train_metrics.loss,
                    train_metrics.accuracy,
                    valid_metrics.loss,
                    valid_metrics.accuracy
                );
                valid_metrics.loss
            };
            run.log(&metrics(&epoch_log))?;

            match early_stopping.update(epoch, monitored) {
                StopDecision::Improved => best_weights = Some(snapshot(&self.vs)),
                StopDecision::NoImprovement => {}
                StopDecision::Stop => {
                    println!("Early stopping after epoch {}", epoch + 1);
                    break;
                }
            }
        }

        if early_stopping.restore_best() {
            if let Some(weights) = &best_weights {
                restore(&mut self.vs, weights)?;
                log::info!(
                    "Restored weights from epoch {:?} (loss {:.4})",
                    early_stopping.best_epoch().map(|e| e + 1),
                    early_stopping.best()
                );
            }
        }
        self.best_epoch = early_stopping.best_epoch();

        Ok(history)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_safetensors(&self.vs, path.as_ref())?;
        println!("Saved weights to {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CaptionMapping;
    use caption_core::safetensors_util::load_safetensors;
    use std::path::PathBuf;
    use tch::Kind;
    use tokenizer::TextVectorizer;
    use tracker::{read_history, Tracker};

    fn write_image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let pixels = (Tensor::rand([3, 16, 16], (Kind::Float, Device::Cpu)) * 255.0).to_kind(Kind::Uint8);
        tch::vision::image::save(&pixels, &path).unwrap();
        path
    }

    fn tiny_settings() -> Settings {
        Settings {
            image_size: (16, 16),
            seq_length: 6,
            embed_dim: 8,
            num_heads: 2,
            ff_dim: 16,
            cnn_channels: vec![4, 8],
            batch_size: 2,
            epochs: 2,
            captions_per_image: 2,
            warmup_steps: 10,
            seed: Some(11),
            ..Default::default()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        run: Run,
        dataset: CaptionDataset,
        trainer: Trainer,
    }

    fn fixture(settings: &Settings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let entries = ["a.png", "b.png", "c.png"]
            .iter()
            .zip(["a cat", "a dog", "a bird"])
            .map(|(name, caption)| {
                let path = write_image(dir.path(), name);
                (path.display().to_string(), vec![caption.to_string()])
            })
            .collect();
        let mapping = CaptionMapping::from_entries(entries).unwrap();

        let mut vectorizer = TextVectorizer::new(50, settings.seq_length).unwrap();
        vectorizer.adapt(&mapping.captions().collect::<Vec<_>>()).unwrap();
        let dataset = CaptionDataset::new(&mapping, &vectorizer, settings, false, Device::Cpu).unwrap();

        let model_config = settings.model_config(vectorizer.vocab_size().unwrap());
        let trainer = Trainer::new(model_config, settings, Device::Cpu).unwrap();

        let tracker = Tracker::login(dir.path().join("tracking"), "key").unwrap();
        let run = tracker.init("proj", "team").unwrap();
        Fixture {
            dir,
            run,
            dataset,
            trainer,
        }
    }

    #[test]
    fn each_caption_slot_is_one_optimizer_step() {
        let settings = tiny_settings();
        let mut fx = fixture(&settings);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = fx.dataset.batches(2, false, &mut rng).next().unwrap().unwrap();

        let (loss, accuracy) = fx.trainer.train_batch(&batch).unwrap();
        assert_eq!(fx.trainer.global_step(), 2);
        assert!(loss.is_finite());
        assert!((0.0..=1.0).contains(&accuracy));
    }

    #[test]
    fn evaluation_leaves_weights_untouched() {
        let settings = tiny_settings();
        let mut fx = fixture(&settings);
        let before = snapshot(fx.trainer.var_store());

        let result = fx.trainer.evaluate(&fx.dataset).unwrap();
        assert!(result.loss.is_finite());
        assert_eq!(fx.trainer.global_step(), 0);

        let after = fx.trainer.var_store().variables();
        for (name, tensor) in &before {
            let diff = (&after[name] - tensor).abs().max().double_value(&[]);
            assert!(diff < 1e-9, "{} changed during evaluation", name);
        }
    }

    #[test]
    fn fit_logs_batches_and_epochs() {
        let settings = tiny_settings();
        let mut fx = fixture(&settings);
        let run_dir = fx.run.dir().to_path_buf();

        let history = fx.trainer.fit(&fx.dataset, &fx.dataset, &mut fx.run).unwrap();
        let epochs = history.epochs();
        assert!(epochs >= 1 && epochs <= settings.epochs);
        for key in [EPOCH_TRAIN_LOSS, EPOCH_TRAIN_ACCURACY, EPOCH_VALID_LOSS, EPOCH_VALID_ACCURACY] {
            assert_eq!(history.get(key).unwrap().len(), epochs);
        }

        let lines = read_history(&run_dir).unwrap();
        // Two batches per epoch plus one epoch line.
        assert_eq!(lines.len(), epochs * 3);
        assert!(lines[0].contains_key(BATCH_TRAIN_LOSS));
        assert!(lines[2].contains_key(EPOCH_VALID_LOSS));
        assert_eq!(fx.trainer.global_step(), (epochs * 2 * settings.captions_per_image) as u64);
    }

    fn stopping_settings(restore_best_weights: bool) -> Settings {
        // Any drop smaller than min_delta is no improvement, so only the first epoch counts.
        Settings {
            epochs: 8,
            early_stopping_patience: 1,
            early_stopping_min_delta: 1e30,
            restore_best_weights,
            warmup_steps: 1,
            ..tiny_settings()
        }
    }

    #[test]
    fn early_stopping_ends_fit_and_restores_the_best_epoch() {
        let settings = stopping_settings(true);
        let mut fx = fixture(&settings);

        let history = fx.trainer.fit(&fx.dataset, &fx.dataset, &mut fx.run).unwrap();
        let best = fx.trainer.best_epoch().unwrap();
        assert_eq!(best, 0);
        assert_eq!(history.epochs(), best + settings.early_stopping_patience + 1);
        assert_eq!(fx.trainer.global_step(), (history.epochs() * 2 * settings.captions_per_image) as u64);

        let valid_losses = history.get(EPOCH_VALID_LOSS).unwrap();
        let restored = fx.trainer.evaluate(&fx.dataset).unwrap().loss;
        assert!((restored - valid_losses[best]).abs() < 1e-5, "{} vs {:?}", restored, valid_losses);
    }

    #[test]
    fn without_restore_the_last_epoch_weights_remain() {
        let settings = stopping_settings(false);
        let mut fx = fixture(&settings);

        let history = fx.trainer.fit(&fx.dataset, &fx.dataset, &mut fx.run).unwrap();
        assert_eq!(history.epochs(), 2);

        let valid_losses = history.get(EPOCH_VALID_LOSS).unwrap();
        let current = fx.trainer.evaluate(&fx.dataset).unwrap().loss;
        assert!((current - valid_losses[1]).abs() < 1e-5, "{} vs {:?}", current, valid_losses);
    }

    #[test]
    fn fit_keeps_the_lowest_validation_loss() {
        let settings = Settings {
            epochs: 8,
            early_stopping_patience: 1,
            warmup_steps: 1,
            ..tiny_settings()
        };
        let mut fx = fixture(&settings);

        let history = fx.trainer.fit(&fx.dataset, &fx.dataset, &mut fx.run).unwrap();
        let valid_losses = history.get(EPOCH_VALID_LOSS).unwrap();
        let best = fx.trainer.best_epoch().unwrap();
        if history.epochs() < settings.epochs {
            assert_eq!(history.epochs(), best + settings.early_stopping_patience + 1);
        }

        let lowest = valid_losses.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!(valid_losses[best], lowest);
        let restored = fx.trainer.evaluate(&fx.dataset).unwrap().loss;
        assert!((restored - lowest).abs() < 1e-5, "{} vs {:?}", restored, valid_losses);
    }

    #[test]
    fn pretrained_cnn_weights_freeze_the_backbone() {
        let settings = tiny_settings();
        let fx = fixture(&settings);
        let path = fx.dir.path().join("backbone.safetensors");
        fx.trainer.save_weights(&path).unwrap();

        let pretrained = Settings {
            cnn_weights: Some(path),
            seed: Some(99),
            ..tiny_settings()
        };
        let config = fx.trainer.model().config.clone();
        let trainer = Trainer::new(config, &pretrained, Device::Cpu).unwrap();
        assert!(trainer.model().cnn_frozen());
        assert!(
            ImageCaptioningModel::parameter_count(trainer.var_store())
                < ImageCaptioningModel::parameter_count(fx.trainer.var_store())
        );

        let original = fx.trainer.var_store().variables();
        for (name, tensor) in trainer.var_store().variables() {
            if name.starts_with(CNN_PREFIX) {
                assert!(!tensor.requires_grad(), "{}", name);
                assert!((&tensor - &original[&name]).abs().max().double_value(&[]) < 1e-6);
            }
        }
    }

    #[test]
    fn cnn_weights_without_backbone_tensors_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unrelated.safetensors");
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = (vs.root() / "decoder").var("extra", &[3], nn::Init::Const(1.0));
        save_safetensors(&vs, &path).unwrap();

        let settings = Settings {
            cnn_weights: Some(path),
            ..tiny_settings()
        };
        let config = settings.model_config(10);
        assert!(Trainer::new(config, &settings, Device::Cpu).is_err());
    }

    #[test]
    fn saved_weights_reload_into_a_fresh_model() {
        let settings = tiny_settings();
        let fx = fixture(&settings);
        let path = fx.dir.path().join("weights.safetensors");
        fx.trainer.save_weights(&path).unwrap();

        let mut vs = nn::VarStore::new(Device::Cpu);
        let _model = ImageCaptioningModel::new(&vs.root(), &fx.trainer.model().config);
        let loaded = load_safetensors(&mut vs, &path).unwrap();
        assert_eq!(loaded, fx.trainer.var_store().variables().len());
    }
}
