use anyhow::Result;

use trainer::pipeline;
use trainer::Settings;

fn main() -> Result<()> {
    env_logger::init();

    let settings = Settings::load()?;
    let output = pipeline::run(&settings)?;

    println!("Artifacts written to {:?}", settings.save_dir);
    println!("Tracking run {} stored in {:?}", output.run.run_id, output.run_dir);
    println!("Training complete!");

    Ok(())
}
