use tch::{nn, IndexOp, Tensor};

use crate::cnn::CnnFeatureExtractor;
use crate::config::ModelConfig;
use crate::loss::{masked_accuracy, masked_cross_entropy};
use crate::transformer::{TransformerDecoderBlock, TransformerEncoderBlock};

/// Variable-name prefix of the CNN backbone inside the model's `VarStore`.
pub const CNN_PREFIX: &str = "cnn.";

/// Loss and accuracy of one caption slot.
pub struct CaptionStep {
    /// Scalar loss tensor, still attached to the graph when computed in training mode.
    pub loss: Tensor,
    pub accuracy: f64,
}

/// CNN feature extractor, two encoder blocks and one decoder block.
pub struct ImageCaptioningModel {
    cnn: CnnFeatureExtractor,
    encoder: TransformerEncoderBlock,
    encoder2: TransformerEncoderBlock,
    decoder: TransformerDecoderBlock,
    pub config: ModelConfig,
}

impl ImageCaptioningModel {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let cnn = CnnFeatureExtractor::new(&(vs / "cnn"), config);
        let encoder = TransformerEncoderBlock::new(
            &(vs / "encoder"),
            config.embed_dim,
            config.ff_dim,
            config.num_heads,
            config,
        );
        let encoder2 = TransformerEncoderBlock::new(
            &(vs / "encoder2"),
            config.embed_dim,
            config.ff_dim,
            config.num_heads,
            config,
        );
        let decoder = TransformerDecoderBlock::new(
            &(vs / "decoder"),
            config.embed_dim,
            config.ff_dim,
            config.num_heads,
            config.vocab_size,
            config,
        );

        Self {
            cnn,
            encoder,
            encoder2,
            decoder,
            config: config.clone(),
        }
    }

    /// Freezes the backbone and marks its variables in `vs` as not requiring gradients.
    pub fn freeze_cnn(&mut self, vs: &nn::VarStore) {
        self.cnn.freeze();
        for (name, tensor) in vs.variables() {
            if name.starts_with(CNN_PREFIX) {
                let _ = tensor.set_requires_grad(false);
            }
        }
    }

    pub fn cnn_frozen(&self) -> bool {
        self.cnn.is_frozen()
    }

    /// images: [batch, 3, H, W] -> [batch, patches, embed_dim]
    pub fn image_features(&self, images: &Tensor, train: bool) -> Tensor {
        self.cnn.forward_t(images, train)
    }

    /// Runs both encoder blocks over CNN features.
    pub fn encode_features(&self, features: &Tensor, train: bool) -> Tensor {
        let x = self.encoder.forward_t(features, train);
        self.encoder2.forward_t(&x, train)
    }

    pub fn decode(&self, tokens: &Tensor, encoder_out: &Tensor, train: bool) -> Tensor {
        self.decoder.forward_t(tokens, encoder_out, train)
    }

    /// images: [batch, 3, H, W], tokens: [batch, T] caption prefix
    /// Returns logits: [batch, T, vocab_size]
    pub fn forward_t(&self, images: &Tensor, tokens: &Tensor, train: bool) -> Tensor {
        let features = self.image_features(images, train);
        let encoded = self.encode_features(&features, train);
        self.decode(tokens, &encoded, train)
    }

    /// Teacher-forced loss for a batch of tokenized captions.
    ///
    /// features: CNN output for the batch, sequences: [batch, seq_length]
    pub fn caption_step(&self, features: &Tensor, sequences: &Tensor, train: bool) -> CaptionStep {
        let len = sequences.size()[1];
        let inputs = sequences.narrow(1, 0, len - 1);
        let targets = sequences.narrow(1, 1, len - 1);
        let mask = targets.ne(0);

        let encoded = self.encode_features(features, train);
        let logits = self.decode(&inputs, &encoded, train);

        let loss = masked_cross_entropy(&logits, &targets, &mask);
        let accuracy = tch::no_grad(|| masked_accuracy(&logits, &targets, &mask)).double_value(&[]);

        CaptionStep { loss, accuracy }
    }

    /// Greedy decoding for a single image.
    ///
    /// Starts from `start_id` and stops at `end_id` or after `seq_length - 1`
    /// generated tokens. The returned ids exclude both markers.
    pub fn generate(&self, image: &Tensor, start_id: i64, end_id: i64) -> Vec<i64> {
        let _guard = tch::no_grad_guard();
        let device = image.device();

        let image = if image.dim() == 3 { image.unsqueeze(0) } else { image.shallow_clone() };
        let features = self.image_features(&image, false);
        let encoded = self.encode_features(&features, false);

        let max_len = self.config.seq_length - 1;
        let mut tokens = vec![start_id];
        let mut generated = Vec::new();

        for step in 0..max_len {
            let mut padded = tokens.clone();
            padded.resize(max_len as usize, 0);
            let input = Tensor::from_slice(&padded).view([1, max_len]).to(device);

            let logits = self.decode(&input, &encoded, false);
            let next = logits.i((0, step, ..)).argmax(-1, false).int64_value(&[]);

            if next == end_id {
                break;
            }
            generated.push(next);
            tokens.push(next);
        }

        generated
    }

    /// Number of scalars in variables that still receive gradients.
    pub fn parameter_count(vs: &nn::VarStore) -> i64 {
        vs.trainable_variables()
            .iter()
            .filter(|t| t.requires_grad())
            .map(|t| t.size().iter().product::<i64>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::OptimizerConfig, Device, Kind};

    fn dummy_images(batch: i64, config: &ModelConfig) -> Tensor {
        let (h, w) = config.image_size;
        Tensor::ones([batch, 3, h, w], (Kind::Float, Device::Cpu))
    }

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            image_size: (16, 16),
            embed_dim: 8,
            ff_dim: 16,
            num_heads: 2,
            seq_length: 6,
            vocab_size: 9,
            cnn_channels: vec![4, 8],
            attention_dropout: 0.0,
            ffn_dropout: 0.0,
            output_dropout: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn forward_produces_logits_per_prefix_token() {
        let config = tiny_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ImageCaptioningModel::new(&vs.root(), &config);
        let images = dummy_images(2, &config);
        let tokens = Tensor::from_slice(&[2i64, 3, 4, 0, 0, 2, 5, 6, 7, 0]).view([2, 5]);
        let logits = model.forward_t(&images, &tokens, false);
        assert_eq!(logits.size(), vec![2, 5, 9]);
    }

    #[test]
    fn training_steps_reduce_loss_on_a_fixed_batch() {
        tch::manual_seed(7);
        let config = tiny_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ImageCaptioningModel::new(&vs.root(), &config);
        let mut opt = nn::Adam::default().build(&vs, 1e-2).unwrap();

        let images = Tensor::rand([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let seqs = Tensor::from_slice(&[2i64, 3, 4, 5, 0, 0, 2, 6, 7, 8, 5, 0]).view([2, 6]);

        let first = {
            let feats = model.image_features(&images, true);
            let step = model.caption_step(&feats, &seqs, true);
            let value = step.loss.double_value(&[]);
            opt.backward_step(&step.loss);
            value
        };
        let mut last = first;
        for _ in 0..30 {
            let feats = model.image_features(&images, true);
            let step = model.caption_step(&feats, &seqs, true);
            last = step.loss.double_value(&[]);
            opt.backward_step(&step.loss);
        }
        assert!(last < first);
    }

    #[test]
    fn generate_stops_within_sequence_length() {
        let config = tiny_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ImageCaptioningModel::new(&vs.root(), &config);
        let image = Tensor::rand([3, 16, 16], (Kind::Float, Device::Cpu));
        let ids = model.generate(&image, 2, 5);
        assert!(ids.len() < config.seq_length as usize);
        assert!(!ids.contains(&5));
    }

    #[test]
    fn frozen_cnn_is_reported() {
        let config = tiny_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let mut model = ImageCaptioningModel::new(&vs.root(), &config);
        assert!(!model.cnn_frozen());
        let all = ImageCaptioningModel::parameter_count(&vs);

        model.freeze_cnn(&vs);
        assert!(model.cnn_frozen());
        let remaining = ImageCaptioningModel::parameter_count(&vs);
        assert!(remaining > 0 && remaining < all);

        for (name, tensor) in vs.variables() {
            assert_eq!(tensor.requires_grad(), !name.starts_with(CNN_PREFIX), "{}", name);
        }
    }
}
