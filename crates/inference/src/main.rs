use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tch::Device;

use inference::load_captioner;

#[derive(Parser)]
#[command(author, version, about = "Generate captions with a trained model", long_about = None)]
struct Cli {
    /// Training output directory (config_train.json, tokenizer.json, weights)
    #[arg(short, long, default_value = "save_train_dir")]
    save_dir: PathBuf,

    /// Weights file, if the directory holds more than one
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Images to caption
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let device = Device::cuda_if_available();
    tracing::info!("Using device: {:?}", device);

    let captioner = load_captioner(&cli.save_dir, cli.weights.as_deref(), device)?;
    for image in &cli.images {
        let caption = captioner.caption(image)?;
        println!("{}: {}", image.display(), caption);
    }

    Ok(())
}
