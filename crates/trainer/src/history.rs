use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub const HISTORY_FILE: &str = "history.json";

pub const EPOCH_TRAIN_LOSS: &str = "epoch_train_loss";
pub const EPOCH_TRAIN_ACCURACY: &str = "epoch_train_accuracy";
pub const EPOCH_VALID_LOSS: &str = "epoch_valid_loss";
pub const EPOCH_VALID_ACCURACY: &str = "epoch_valid_accuracy";
pub const BATCH_TRAIN_LOSS: &str = "batch_train_loss";
pub const BATCH_TRAIN_ACCURACY: &str = "batch_train_accuracy";

/// Per-epoch values of every metric, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    metrics: BTreeMap<String, Vec<f64>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: f64) {
        self.metrics.entry(name.to_string()).or_default().push(value);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.metrics.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Number of epochs recorded.
    pub fn epochs(&self) -> usize {
        self.metrics.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(serde_json::from_str(&content)?)
    }
}
