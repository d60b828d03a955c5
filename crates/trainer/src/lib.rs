pub mod augment;
pub mod data;
pub mod dataset;
pub mod early_stopping;
pub mod history;
pub mod persist;
pub mod pipeline;
pub mod schedule;
pub mod settings;
pub mod train;

pub use dataset::{CaptionBatch, CaptionDataset};
pub use history::History;
pub use pipeline::PipelineOutput;
pub use settings::Settings;
pub use train::{EvalMetrics, Trainer};
