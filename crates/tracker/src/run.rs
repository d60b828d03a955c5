use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TrackerError};

pub const METADATA_FILE: &str = "run.json";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";
pub const FILES_DIR: &str = "files";

/// Scalar metrics for one `log` call, keyed by name.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
}

/// Persisted description of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project: String,
    pub entity: String,
    pub status: RunStatus,
    pub steps: u64,
    pub files: Vec<String>,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
}

/// An active tracking run. Created by [`crate::Tracker::init`].
pub struct Run {
    record: RunRecord,
    dir: PathBuf,
    metrics: BufWriter<File>,
    summary: Map<String, Value>,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Run {
    pub(crate) fn create(dir: PathBuf, run_id: String, project: &str, entity: &str) -> Result<Self> {
        fs::create_dir_all(dir.join(FILES_DIR))?;
        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(METRICS_FILE))?;

        let run = Self {
            record: RunRecord {
                run_id,
                project: project.to_string(),
                entity: entity.to_string(),
                status: RunStatus::Running,
                steps: 0,
                files: Vec::new(),
                start_time_ms: now_ms(),
                end_time_ms: None,
            },
            dir,
            metrics: BufWriter::new(metrics),
            summary: Map::new(),
        };
        run.write_metadata()?;
        Ok(run)
    }

    pub fn id(&self) -> &str {
        &self.record.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn step(&self) -> u64 {
        self.record.steps
    }

    /// Appends one line to the run history; the values also become the
    /// latest summary entries.
    pub fn log(&mut self, metrics: &Metrics) -> Result<()> {
        let mut line = Map::new();
        line.insert("_step".to_string(), Value::from(self.record.steps));
        line.insert("_timestamp".to_string(), Value::from(now_ms()));
        for (key, value) in metrics {
            line.insert(key.clone(), Value::from(*value));
            self.summary.insert(key.clone(), Value::from(*value));
        }

        serde_json::to_writer(&mut self.metrics, &line)?;
        self.metrics.write_all(b"\n")?;
        self.metrics.flush()?;
        self.record.steps += 1;
        Ok(())
    }

    /// Sets summary values without adding a history line.
    pub fn summary(&mut self, metrics: &Metrics) {
        for (key, value) in metrics {
            self.summary.insert(key.clone(), Value::from(*value));
        }
    }

    pub fn summary_values(&self) -> &Map<String, Value> {
        &self.summary
    }

    /// Copies `path` into the run's `files/` directory.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<PathBuf> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .filter(|_| path.is_file())
            .ok_or_else(|| TrackerError::NotAFile(path.display().to_string()))?
            .to_string_lossy()
            .into_owned();

        let target = self.dir.join(FILES_DIR).join(&name);
        fs::copy(path, &target)?;
        if !self.record.files.contains(&name) {
            self.record.files.push(name);
        }
        self.write_metadata()?;
        log::debug!("Mirrored {:?} to run {}", path, self.record.run_id);
        Ok(target)
    }

    /// Writes the summary and marks the run finished.
    pub fn finish(mut self) -> Result<RunRecord> {
        self.metrics.flush()?;
        let file = File::create(self.dir.join(SUMMARY_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.summary)?;

        self.record.status = RunStatus::Finished;
        self.record.end_time_ms = Some(now_ms());
        self.write_metadata()?;
        log::info!("Run {} finished after {} steps", self.record.run_id, self.record.steps);
        Ok(self.record)
    }

    fn write_metadata(&self) -> Result<()> {
        let file = File::create(self.dir.join(METADATA_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.record)?;
        Ok(())
    }
}

/// Reads back every history line of a run directory.
pub fn read_history<P: AsRef<Path>>(run_dir: P) -> Result<Vec<Map<String, Value>>> {
    let content = fs::read_to_string(run_dir.as_ref().join(METRICS_FILE))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TrackerError::from))
        .collect()
}
