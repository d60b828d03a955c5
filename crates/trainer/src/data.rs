use anyhow::{bail, Context, Result};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

/// Image path -> captions, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptionMapping {
    entries: Vec<(String, Vec<String>)>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaptionValue {
    One(String),
    Many(Vec<String>),
}

impl From<CaptionValue> for Vec<String> {
    fn from(value: CaptionValue) -> Self {
        match value {
            CaptionValue::One(caption) => vec![caption],
            CaptionValue::Many(captions) => captions,
        }
    }
}

impl CaptionMapping {
    /// Builds a mapping, rejecting duplicate image keys.
    pub fn from_entries(entries: Vec<(String, Vec<String>)>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for (key, _) in &entries {
            if !seen.insert(key.as_str()) {
                bail!("Duplicate image key {:?}", key);
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// All captions flattened in order.
    pub fn captions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().flat_map(|(_, v)| v.iter().map(String::as_str))
    }

    fn truncated(mut self, n: usize) -> Self {
        self.entries.truncate(n);
        self
    }

    fn split_at(mut self, at: usize) -> (Self, Self) {
        let rest = self.entries.split_off(at.min(self.entries.len()));
        (self, Self { entries: rest })
    }
}

impl<'de> Deserialize<'de> for CaptionMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = CaptionMapping;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping image paths to a caption or a list of captions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                let mut seen = HashSet::new();
                while let Some((key, value)) = map.next_entry::<String, CaptionValue>()? {
                    if !seen.insert(key.clone()) {
                        return Err(de::Error::custom(format!("duplicate image key {:?}", key)));
                    }
                    entries.push((key, value.into()));
                }
                Ok(CaptionMapping { entries })
            }
        }

        deserializer.deserialize_map(MappingVisitor)
    }
}

impl Serialize for CaptionMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(k, v)| (k, v)))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Corpus {
    List(Vec<String>),
    Mapping(CaptionMapping),
}

/// Reads a caption mapping (train or validation split).
pub fn load_mapping<P: AsRef<Path>>(path: P) -> Result<CaptionMapping> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse caption mapping {:?}", path))
}

/// Writes a caption mapping as a JSON object, keys in mapping order.
pub fn save_mapping<P: AsRef<Path>>(mapping: &CaptionMapping, path: P) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(mapping)?;
    fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
}

/// Reads the text corpus used to adapt the tokenizer: either a list of
/// strings or a caption mapping whose captions are flattened.
pub fn load_corpus<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let corpus: Corpus =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse text corpus {:?}", path))?;
    Ok(match corpus {
        Corpus::List(texts) => texts,
        Corpus::Mapping(mapping) => mapping.captions().map(String::from).collect(),
    })
}

/// Keeps the first `num_train` / `num_valid` images of each split.
pub fn reduce_dataset_dim(
    train: CaptionMapping,
    valid: CaptionMapping,
    num_train: usize,
    num_valid: usize,
) -> (CaptionMapping, CaptionMapping) {
    let (train_before, valid_before) = (train.len(), valid.len());
    let train = train.truncated(num_train);
    let valid = valid.truncated(num_valid);
    log::info!(
        "Reduced dataset: train {} -> {}, valid {} -> {}",
        train_before,
        train.len(),
        valid_before,
        valid.len()
    );
    (train, valid)
}

/// Splits the validation mapping into (validation, test). The first
/// `round(len * ratio)` images stay in validation.
pub fn valid_test_split(valid: CaptionMapping, ratio: f64) -> Result<(CaptionMapping, CaptionMapping)> {
    if !(0.0..=1.0).contains(&ratio) {
        bail!("Split ratio must lie in [0, 1], got {}", ratio);
    }
    let total = valid.len();
    let split_at = ((total as f64) * ratio).round() as usize;
    let (valid, test) = valid.split_at(split_at);
    log::info!(
        "Validation split: {} -> {} validation / {} test",
        total,
        valid.len(),
        test.len()
    );
    Ok((valid, test))
}
