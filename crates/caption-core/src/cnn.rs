use tch::{nn, Device, Kind, Tensor};

use crate::config::ModelConfig;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

struct ConvStage {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl ConvStage {
    fn new(vs: &nn::Path, c_in: i64, c_out: i64) -> Self {
        let conv_config = nn::ConvConfig {
            stride: 2,
            padding: 1,
            bias: false,
            ..Default::default()
        };
        Self {
            conv: nn::conv2d(vs / "conv", c_in, c_out, 3, conv_config),
            bn: nn::batch_norm2d(vs / "bn", c_out, Default::default()),
        }
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.conv).apply_t(&self.bn, train).relu()
    }
}

/// Convolutional backbone turning images into a sequence of visual features.
pub struct CnnFeatureExtractor {
    stages: Vec<ConvStage>,
    projection: nn::Conv2D,
    mean: Tensor,
    std: Tensor,
    frozen: bool,
}

impl CnnFeatureExtractor {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let mut stages = Vec::with_capacity(config.cnn_channels.len());
        let mut c_in = 3;
        for (i, &c_out) in config.cnn_channels.iter().enumerate() {
            stages.push(ConvStage::new(&(vs / "stages" / i), c_in, c_out));
            c_in = c_out;
        }
        let projection = nn::conv2d(vs / "projection", c_in, config.embed_dim, 1, Default::default());

        let device = vs.device();
        Self {
            stages,
            projection,
            mean: channel_constant(&IMAGENET_MEAN, device),
            std: channel_constant(&IMAGENET_STD, device),
            frozen: false,
        }
    }

    /// Stops gradient flow into the backbone, e.g. after loading pretrained weights.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// images: [batch, 3, H, W] in [0, 1]
    /// Returns: [batch, H'*W', embed_dim]
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Tensor {
        let run = || {
            let mut x = (images - &self.mean) / &self.std;
            for stage in &self.stages {
                x = stage.forward_t(&x, train && !self.frozen);
            }
            x.apply(&self.projection).flatten(2, -1).transpose(1, 2)
        };

        if self.frozen {
            tch::no_grad(run)
        } else {
            run()
        }
    }
}

impl std::fmt::Debug for CnnFeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CnnFeatureExtractor")
            .field("stages", &self.stages.len())
            .field("frozen", &self.frozen)
            .finish()
    }
}

fn channel_constant(values: &[f32; 3], device: Device) -> Tensor {
    Tensor::from_slice(values)
        .view([1, 3, 1, 1])
        .to_kind(Kind::Float)
        .to_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            image_size: (32, 24),
            embed_dim: 8,
            cnn_channels: vec![4, 6, 8],
            ..Default::default()
        }
    }

    #[test]
    fn flattens_spatial_map_into_patches() {
        let config = config();
        let vs = nn::VarStore::new(Device::Cpu);
        let cnn = CnnFeatureExtractor::new(&vs.root(), &config);
        let images = Tensor::rand([2, 3, 32, 24], (Kind::Float, Device::Cpu));
        let feats = cnn.forward_t(&images, false);
        assert_eq!(feats.size(), vec![2, config.num_patches(), 8]);
    }

    #[test]
    fn frozen_backbone_produces_no_graph() {
        let config = config();
        let vs = nn::VarStore::new(Device::Cpu);
        let mut cnn = CnnFeatureExtractor::new(&vs.root(), &config);
        cnn.freeze();
        let images = Tensor::rand([1, 3, 32, 24], (Kind::Float, Device::Cpu));
        assert!(!cnn.forward_t(&images, true).requires_grad());
    }
}
