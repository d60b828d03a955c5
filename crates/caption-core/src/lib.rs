pub mod attention;
pub mod cnn;
pub mod config;
pub mod image;
pub mod layer_norm;
pub mod loss;
pub mod model;
pub mod safetensors_util;
pub mod transformer;

pub use cnn::CnnFeatureExtractor;
pub use config::{ModelConfig, TrainConfigRecord, CONFIG_TRAIN_FILE};
pub use image::load_image;
pub use model::{CaptionStep, ImageCaptioningModel, CNN_PREFIX};
pub use transformer::{TransformerDecoderBlock, TransformerEncoderBlock};
