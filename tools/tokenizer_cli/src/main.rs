use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokenizer::{TextVectorizer, TOKENIZER_FILE};
use trainer::data::load_corpus;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Adapt a tokenizer on a JSON text corpus
    Adapt {
        /// JSON array of strings, or an object of image -> caption(s)
        corpus: PathBuf,

        /// Output directory for tokenizer.json
        #[arg(short, long, default_value = "save_train_dir")]
        output_dir: PathBuf,

        /// Maximum vocabulary size, reserved tokens included
        #[arg(short, long, default_value_t = 2_000_000)]
        max_tokens: usize,

        /// Fixed output sequence length
        #[arg(short, long, default_value_t = 25)]
        seq_length: usize,
    },
    /// Encode text using an adapted tokenizer
    Encode {
        /// Path to tokenizer.json
        #[arg(long)]
        tokenizer: PathBuf,

        /// Text to encode
        #[arg(short, long)]
        text: String,
    },
    /// Decode IDs using an adapted tokenizer
    Decode {
        /// Path to tokenizer.json
        #[arg(long)]
        tokenizer: PathBuf,

        /// IDs to decode (comma separated)
        #[arg(short, long)]
        ids: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Adapt {
            corpus,
            output_dir,
            max_tokens,
            seq_length,
        } => {
            println!("Adapting tokenizer on {:?}...", corpus);
            let texts = load_corpus(&corpus)?;
            let mut vectorizer = TextVectorizer::new(max_tokens, seq_length)?;
            vectorizer.adapt(&texts)?;

            let path = vectorizer.save(&output_dir).context("Failed to save tokenizer")?;
            println!(
                "Saved {} tokens from {} texts to {:?}",
                vectorizer.vocab_size()?,
                texts.len(),
                path
            );
        }
        Commands::Encode { tokenizer, text } => {
            let vectorizer = load(&tokenizer)?;
            let ids = vectorizer.encode(&text)?;
            println!("Encoded IDs: {:?}", ids);
        }
        Commands::Decode { tokenizer, ids } => {
            let vectorizer = load(&tokenizer)?;
            let id_list = ids
                .split(',')
                .map(|s| s.trim().parse::<u32>().with_context(|| format!("Invalid ID {:?}", s)))
                .collect::<Result<Vec<_>>>()?;
            let text = vectorizer.decode(&id_list)?;
            println!("Decoded text: {}", text);
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<TextVectorizer> {
    let path = if path.is_dir() { path.join(TOKENIZER_FILE) } else { path.to_path_buf() };
    TextVectorizer::load(&path).with_context(|| format!("Failed to load tokenizer {:?}", path))
}
