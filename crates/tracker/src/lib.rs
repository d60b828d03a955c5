//! Experiment-tracking client.
//!
//! A [`Tracker`] is obtained by logging in with an API key and hands out
//! [`Run`]s tagged with a project and an entity. Runs are stored on disk under
//! `<root>/<project>/<run-id>/`:
//!
//! - `run.json`: run metadata and status
//! - `metrics.jsonl`: one JSON object per `log` call, with `_step`
//! - `summary.json`: latest value of every metric, written by `finish`
//! - `files/`: artifacts mirrored with `save`

pub mod error;
pub mod run;

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

pub use error::{Result, TrackerError};
pub use run::{read_history, Metrics, Run, RunRecord, RunStatus};

#[derive(Debug, Clone)]
pub struct Tracker {
    root: PathBuf,
    api_key: String,
}

impl Tracker {
    /// Authenticates with `api_key`. Leading and trailing whitespace is ignored.
    pub fn login<P: AsRef<Path>>(root: P, api_key: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(TrackerError::EmptyApiKey);
        }
        fs::create_dir_all(root.as_ref())?;
        log::info!("Logged in to experiment tracker at {:?}", root.as_ref());
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            api_key: api_key.to_string(),
        })
    }

    /// Reads the API key from `key_path`, then logs in.
    pub fn login_from_file<P: AsRef<Path>, K: AsRef<Path>>(root: P, key_path: K) -> Result<Self> {
        let api_key = fs::read_to_string(key_path)?;
        Self::login(root, &api_key)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Last four characters of the key, for log lines.
    pub fn key_hint(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
        format!("****{}", tail)
    }

    /// Starts a new run under `project`, owned by `entity`.
    pub fn init(&self, project: &str, entity: &str) -> Result<Run> {
        validate_name(project)?;
        validate_name(entity)?;

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let run_id = format!("{}-{}", run::now_ms(), suffix.to_lowercase());
        let dir = self.root.join(project).join(&run_id);

        let run = Run::create(dir, run_id, project, entity)?;
        log::info!("Started run {} in project {} ({})", run.id(), project, entity);
        Ok(run)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TrackerError::InvalidName(name.to_string()))
    }
}
