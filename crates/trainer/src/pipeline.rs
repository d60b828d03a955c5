use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tch::Device;

use tokenizer::TextVectorizer;
use tracker::{RunRecord, Tracker};

use crate::data::{load_corpus, load_mapping, reduce_dataset_dim, valid_test_split};
use crate::dataset::CaptionDataset;
use crate::history::History;
use crate::persist::{self, SavedArtifacts};
use crate::settings::Settings;
use crate::train::{metrics, EvalMetrics, Trainer};

pub const TRAIN_SAMPLES: &str = "Number of training samples";
pub const VALID_SAMPLES: &str = "Number of validation samples";

/// Version of the `tch` bindings pinned in the workspace and the libtorch release they wrap.
pub const TCH_VERSION: &str = "0.15.0";
pub const LIBTORCH_VERSION: &str = "2.2.0";

pub fn framework_version() -> String {
    format!("tch {} (libtorch {})", TCH_VERSION, LIBTORCH_VERSION)
}

/// Everything a finished training run produced.
#[derive(Debug)]
pub struct PipelineOutput {
    pub history: History,
    pub train: EvalMetrics,
    pub valid: EvalMetrics,
    pub test: Option<EvalMetrics>,
    pub artifacts: SavedArtifacts,
    pub run: RunRecord,
    pub run_dir: PathBuf,
}

/// load data -> fit tokenizer -> split -> build datasets -> build model ->
/// train -> evaluate -> persist -> finish the tracking run.
pub fn run(settings: &Settings) -> Result<PipelineOutput> {
    settings.validate()?;

    let tracker = Tracker::login_from_file(&settings.tracking_dir, &settings.api_key_path)
        .with_context(|| format!("Tracker login failed with key file {:?}", settings.api_key_path))?;
    println!("Logged in to experiment tracker ({})", tracker.key_hint());
    let mut run = tracker.init(&settings.project, &settings.entity)?;
    let run_dir = run.dir().to_path_buf();

    let device = Device::cuda_if_available();
    println!("Framework version: {}", framework_version());
    println!("Using device: {:?}", device);
    println!("Number of CUDA devices: {}", tch::Cuda::device_count());

    let train_mapping = load_mapping(&settings.train_data_json_path)?;
    let valid_mapping = load_mapping(&settings.valid_data_json_path)?;
    let corpus = load_corpus(&settings.text_data_json_path)?;

    let (train_mapping, valid_mapping) = if settings.reduce_dataset {
        reduce_dataset_dim(
            train_mapping,
            valid_mapping,
            settings.num_train_img,
            settings.num_valid_img,
        )
    } else {
        (train_mapping, valid_mapping)
    };
    println!("{}: {}", TRAIN_SAMPLES, train_mapping.len());
    println!("{}: {}", VALID_SAMPLES, valid_mapping.len());
    run.summary(&metrics(&[
        (TRAIN_SAMPLES, train_mapping.len() as f64),
        (VALID_SAMPLES, valid_mapping.len() as f64),
    ]));

    let mut vectorizer = TextVectorizer::new(settings.max_vocab_size, settings.seq_length)?;
    vectorizer.adapt(&corpus)?;
    let vocab_size = vectorizer.vocab_size()?;
    println!("Vocabulary size: {}", vocab_size);

    let (valid_mapping, test_mapping) = valid_test_split(valid_mapping, settings.valid_test_ratio)?;
    println!("Number of validation samples after splitting: {}", valid_mapping.len());
    if settings.test_set {
        println!("Number of test samples: {}", test_mapping.len());
    }
    if valid_mapping.is_empty() {
        bail!(
            "Validation split is empty (valid_test_ratio = {}); early stopping needs validation data",
            settings.valid_test_ratio
        );
    }

    let train_dataset = CaptionDataset::new(&train_mapping, &vectorizer, settings, settings.train_set_aug, device)?;
    let valid_dataset = CaptionDataset::new(&valid_mapping, &vectorizer, settings, settings.valid_set_aug, device)?;
    let test_dataset = match (settings.test_set, test_mapping.is_empty()) {
        (true, false) => Some(CaptionDataset::new(&test_mapping, &vectorizer, settings, false, device)?),
        (true, true) => {
            log::warn!("Test split is empty; skipping test evaluation");
            None
        }
        (false, _) => None,
    };

    let mut trainer = Trainer::new(settings.model_config(vocab_size), settings, device)?;
    let history = trainer.fit(&train_dataset, &valid_dataset, &mut run)?;

    let train = trainer.evaluate(&train_dataset)?;
    let valid = trainer.evaluate(&valid_dataset)?;
    let test = test_dataset
        .as_ref()
        .map(|dataset| trainer.evaluate(dataset))
        .transpose()?;

    let mut final_metrics = vec![
        ("Train Loss", train.loss),
        ("Train Accuracy", train.accuracy),
        ("Valid Loss", valid.loss),
        ("Valid Accuracy", valid.accuracy),
    ];
    if let Some(test) = &test {
        final_metrics.push(("Test Loss", test.loss));
        final_metrics.push(("Test Accuracy", test.accuracy));
    }
    let final_metrics = metrics(&final_metrics);
    run.log(&final_metrics)?;
    run.summary(&final_metrics);

    println!("Train Loss = {:.4} - Train Accuracy = {:.4}", train.loss, train.accuracy);
    println!("Valid Loss = {:.4} - Valid Accuracy = {:.4}", valid.loss, valid.accuracy);
    if let Some(test) = &test {
        println!("Test Loss = {:.4} - Test Accuracy = {:.4}", test.loss, test.accuracy);
    }

    let artifacts = persist::save_all(settings, &history, &trainer, &vectorizer, &mut run)?;
    let run = run.finish()?;

    Ok(PipelineOutput {
        history,
        train,
        valid,
        test,
        artifacts,
        run,
        run_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_version_matches_the_workspace_pin() {
        let manifest = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/../../Cargo.toml")).unwrap();
        let pin = format!("tch = {{ version = \"{}\"", TCH_VERSION);
        assert!(manifest.contains(&pin), "workspace does not pin {}", pin);
        assert!(framework_version().starts_with(&format!("tch {}", TCH_VERSION)));
    }
}
