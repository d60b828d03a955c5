use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tokenizer::standardize::{split_unigrams, standardize};
use trainer::data::{save_mapping, CaptionMapping};

/// Converts a COCO captions annotation file into an image -> captions mapping.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// COCO annotation file (e.g. captions_train2014.json)
    #[arg(short, long)]
    annotations: PathBuf,
    /// Directory holding the images referenced by the annotations
    #[arg(short, long)]
    images_dir: PathBuf,
    /// Output mapping file
    #[arg(short, long)]
    output: PathBuf,
    /// Also write every kept caption as a JSON text corpus
    #[arg(short, long)]
    text_output: Option<PathBuf>,
    /// Images with a caption shorter than this many tokens are dropped
    #[arg(long, default_value_t = 5)]
    min_tokens: usize,
    /// Images with a caption longer than this many tokens are dropped
    #[arg(long, default_value_t = 25)]
    seq_length: usize,
}

#[derive(Deserialize)]
struct Annotations {
    images: Vec<ImageEntry>,
    annotations: Vec<CaptionEntry>,
}

#[derive(Deserialize)]
struct ImageEntry {
    id: u64,
    file_name: String,
}

#[derive(Deserialize)]
struct CaptionEntry {
    image_id: u64,
    caption: String,
}

fn wrap_caption(caption: &str) -> String {
    format!("<start> {} <end>", caption.trim())
}

/// Returns the mapping (images in annotation order) and the number of
/// images dropped by the length filter.
fn build_mapping(
    annotations: Annotations,
    images_dir: &Path,
    min_tokens: usize,
    seq_length: usize,
) -> Result<(CaptionMapping, usize)> {
    let mut captions: HashMap<u64, Vec<String>> = HashMap::new();
    for entry in annotations.annotations {
        captions
            .entry(entry.image_id)
            .or_default()
            .push(wrap_caption(&entry.caption));
    }

    let mut entries = Vec::new();
    let mut skipped = 0;
    for image in annotations.images {
        let Some(image_captions) = captions.remove(&image.id) else {
            continue;
        };
        let within_bounds = image_captions.iter().all(|caption| {
            let tokens = split_unigrams(&standardize(caption)).count();
            (min_tokens..=seq_length).contains(&tokens)
        });
        if !within_bounds {
            skipped += 1;
            continue;
        }
        let path = images_dir.join(&image.file_name);
        entries.push((path.display().to_string(), image_captions));
    }

    Ok((CaptionMapping::from_entries(entries)?, skipped))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let content = fs::read_to_string(&cli.annotations)
        .with_context(|| format!("Failed to read {:?}", cli.annotations))?;
    let annotations: Annotations = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse COCO annotations {:?}", cli.annotations))?;
    println!(
        "Read {} images and {} captions from {:?}",
        annotations.images.len(),
        annotations.annotations.len(),
        cli.annotations
    );

    let (mapping, skipped) = build_mapping(annotations, &cli.images_dir, cli.min_tokens, cli.seq_length)?;
    if let Some(parent) = cli.output.parent() {
        fs::create_dir_all(parent)?;
    }
    save_mapping(&mapping, &cli.output)?;
    println!(
        "Wrote {} images to {:?} ({} dropped by the length filter)",
        mapping.len(),
        cli.output,
        skipped
    );

    if let Some(text_output) = &cli.text_output {
        let corpus: Vec<&str> = mapping.captions().collect();
        fs::write(text_output, serde_json::to_string(&corpus)?)
            .with_context(|| format!("Failed to write {:?}", text_output))?;
        println!("Wrote {} captions to {:?}", corpus.len(), text_output);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn annotations() -> Annotations {
        serde_json::from_str(indoc! {r#"
            {
                "images": [
                    {"id": 2, "file_name": "two.jpg"},
                    {"id": 1, "file_name": "one.jpg"},
                    {"id": 3, "file_name": "three.jpg"},
                    {"id": 4, "file_name": "no_captions.jpg"}
                ],
                "annotations": [
                    {"image_id": 1, "caption": "A cat sitting on a mat."},
                    {"image_id": 2, "caption": "Two dogs play in a park."},
                    {"image_id": 1, "caption": "A small cat resting on the mat."},
                    {"image_id": 3, "caption": "Bird."}
                ]
            }
        "#})
        .unwrap()
    }

    #[test]
    fn groups_captions_in_image_order() {
        let (mapping, skipped) = build_mapping(annotations(), Path::new("/data/train2014"), 5, 25).unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(
            mapping.keys().collect::<Vec<_>>(),
            vec!["/data/train2014/two.jpg", "/data/train2014/one.jpg"]
        );
        assert_eq!(
            mapping.get("/data/train2014/one.jpg").unwrap(),
            &[
                "<start> A cat sitting on a mat. <end>".to_string(),
                "<start> A small cat resting on the mat. <end>".to_string()
            ]
        );
    }

    #[test]
    fn long_captions_drop_the_image() {
        let (mapping, skipped) = build_mapping(annotations(), Path::new("imgs"), 1, 7).unwrap();
        // Both images with eight-token captions exceed the limit.
        assert!(mapping.get("imgs/one.jpg").is_none());
        assert!(mapping.get("imgs/two.jpg").is_none());
        assert!(mapping.get("imgs/three.jpg").is_some());
        assert_eq!(skipped, 2);
    }
}
