use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::path::PathBuf;
use tch::{Device, Tensor};

use caption_core::load_image;
use tokenizer::TextVectorizer;

use crate::augment::Augmentation;
use crate::data::CaptionMapping;
use crate::settings::Settings;

/// One batch of images with their tokenized captions.
pub struct CaptionBatch {
    /// [batch, 3, H, W], float in [0, 1]
    pub images: Tensor,
    /// [batch, captions_per_image, seq_length], int64 token ids
    pub captions: Tensor,
}

impl CaptionBatch {
    pub fn size(&self) -> i64 {
        self.images.size()[0]
    }
}

/// Image paths and their captions, tokenized once at construction.
/// Images are decoded lazily, batch by batch.
pub struct CaptionDataset {
    paths: Vec<PathBuf>,
    /// Flat [images, captions_per_image, seq_length]
    tokens: Vec<i64>,
    captions_per_image: usize,
    seq_length: usize,
    image_size: (i64, i64),
    augmentation: Option<Augmentation>,
    device: Device,
}

impl CaptionDataset {
    pub fn new(
        mapping: &CaptionMapping,
        vectorizer: &TextVectorizer,
        settings: &Settings,
        augment: bool,
        device: Device,
    ) -> Result<Self> {
        let captions_per_image = settings.captions_per_image;
        let seq_length = vectorizer.config().sequence_length;

        let mut paths = Vec::with_capacity(mapping.len());
        let mut tokens = Vec::with_capacity(mapping.len() * captions_per_image * seq_length);

        for (path, captions) in mapping.iter() {
            if captions.is_empty() {
                bail!("Image {:?} has no captions", path);
            }
            // Fewer captions than slots: cycle. More: keep the first ones.
            for slot in 0..captions_per_image {
                let ids = vectorizer.encode(&captions[slot % captions.len()])?;
                tokens.extend(ids.into_iter().map(i64::from));
            }
            paths.push(PathBuf::from(path));
        }

        Ok(Self {
            paths,
            tokens,
            captions_per_image,
            seq_length,
            image_size: settings.image_size,
            augmentation: augment.then(Augmentation::default),
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn captions_per_image(&self) -> usize {
        self.captions_per_image
    }

    pub fn is_augmented(&self) -> bool {
        self.augmentation.is_some()
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        (self.len() + batch_size - 1) / batch_size
    }

    /// Iterates over the dataset in batches of `batch_size`; the last batch
    /// may be smaller.
    pub fn batches<R: Rng>(&self, batch_size: usize, shuffle: bool, rng: &mut R) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            order.shuffle(rng);
        }
        Batches {
            dataset: self,
            order,
            cursor: 0,
            batch_size: batch_size.max(1),
            rng: StdRng::seed_from_u64(rng.gen()),
        }
    }

    fn load_batch(&self, indices: &[usize], seeds: &[u64]) -> Result<CaptionBatch> {
        let images = indices
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&index, &seed)| {
                let image = load_image(&self.paths[index], self.image_size)?;
                Ok(match &self.augmentation {
                    Some(aug) => aug.apply(&image, &mut StdRng::seed_from_u64(seed)),
                    None => image,
                })
            })
            .collect::<Result<Vec<Tensor>>>()?;

        let row = self.captions_per_image * self.seq_length;
        let mut captions = Vec::with_capacity(indices.len() * row);
        for &index in indices {
            captions.extend_from_slice(&self.tokens[index * row..(index + 1) * row]);
        }

        Ok(CaptionBatch {
            images: Tensor::stack(&images, 0).to_device(self.device),
            captions: Tensor::from_slice(&captions)
                .view([
                    indices.len() as i64,
                    self.captions_per_image as i64,
                    self.seq_length as i64,
                ])
                .to_device(self.device),
        })
    }
}

pub struct Batches<'a> {
    dataset: &'a CaptionDataset,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    rng: StdRng,
}

impl Iterator for Batches<'_> {
    type Item = Result<CaptionBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let seeds: Vec<u64> = indices.iter().map(|_| self.rng.gen()).collect();
        Some(self.dataset.load_batch(indices, &seeds))
    }
}
