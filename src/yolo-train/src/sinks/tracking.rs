//! Local experiment tracking.
//!
//! Each run gets `<root>/<run id>/` with the resolved configuration and run
//! status. Metric history is appended to `metrics.jsonl`; only the latest
//! value of each metric stays in memory, written to `summary.json` on close.

use crate::{
    common::CONFIG_FILE,
    sinks::{MetricEvent, RunOutcome, ScalarSink, SinkError},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

pub const RUN_FILE: &str = "run.json";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum RunStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Serialize)]
struct RunInfo {
    id: String,
    status: RunStatus,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct MetricLine<'a> {
    name: &'a str,
    value: f64,
    step: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct MetricSummary {
    count: u64,
    last_step: u64,
    last_value: f64,
}

pub struct ExperimentTracker {
    dir: PathBuf,
    run: RunInfo,
    history: BufWriter<File>,
    summary: BTreeMap<String, MetricSummary>,
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<(), SinkError> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(SinkError::io(path))
}

impl ExperimentTracker {
    /// Starts a run named after the current UTC time.
    pub fn create(root: impl AsRef<Path>, config: &impl Serialize) -> Result<Self, SinkError> {
        let started_at = Utc::now();
        let base = started_at.format("%Y%m%d-%H%M%S").to_string();
        let root = root.as_ref();

        let mut id = base.clone();
        let mut suffix = 1;
        while root.join(&id).exists() {
            id = format!("{base}-{suffix}");
            suffix += 1;
        }
        let dir = root.join(&id);
        fs::create_dir_all(&dir).map_err(SinkError::io(&dir))?;
        write_json(&dir.join(CONFIG_FILE), config)?;
        let history_path = dir.join(METRICS_FILE);
        let history = File::create(&history_path).map_err(SinkError::io(&history_path))?;

        let tracker = Self {
            dir,
            run: RunInfo {
                id,
                status: RunStatus::Running,
                started_at,
                stopped_at: None,
            },
            history: BufWriter::new(history),
            summary: BTreeMap::new(),
        };
        write_json(&tracker.dir.join(RUN_FILE), &tracker.run)?;
        Ok(tracker)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ScalarSink for ExperimentTracker {
    fn name(&self) -> &str {
        "tracker"
    }

    fn record(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
        let line = MetricLine {
            name: &event.name,
            value: event.value,
            step: event.step,
            timestamp: Utc::now(),
        };
        serde_json::to_writer(&mut self.history, &line)?;
        self.history
            .write_all(b"\n")
            .map_err(SinkError::io(self.dir.join(METRICS_FILE)))?;

        match self.summary.get_mut(&event.name) {
            Some(summary) => {
                summary.count += 1;
                summary.last_step = event.step;
                summary.last_value = event.value;
            }
            None => {
                self.summary.insert(
                    event.name.clone(),
                    MetricSummary {
                        count: 1,
                        last_step: event.step,
                        last_value: event.value,
                    },
                );
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.history
            .flush()
            .map_err(SinkError::io(self.dir.join(METRICS_FILE)))
    }

    fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
        self.flush()?;
        write_json(&self.dir.join(SUMMARY_FILE), &self.summary)?;
        self.run.status = match outcome {
            RunOutcome::Finished => RunStatus::Finished,
            RunOutcome::Failed => RunStatus::Failed,
        };
        self.run.stopped_at = Some(Utc::now());
        write_json(&self.dir.join(RUN_FILE), &self.run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn read(path: PathBuf) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn run_directory_holds_config_status_and_history() {
        let root = tempfile::tempdir().unwrap();
        let mut tracker = ExperimentTracker::create(root.path(), &json!({"epochs": 3})).unwrap();
        let dir = tracker.dir().to_path_buf();
        assert_eq!(read(dir.join(CONFIG_FILE))["epochs"], 3);
        assert_eq!(read(dir.join(RUN_FILE))["status"], "running");

        tracker.record(&MetricEvent::new("validation.mAP", 0.5, 1)).unwrap();
        tracker.record(&MetricEvent::new("train/loss", 4.0, 0)).unwrap();
        tracker.record(&MetricEvent::new("validation.mAP", 0.75, 2)).unwrap();
        tracker.close(RunOutcome::Finished).unwrap();

        let history = fs::read_to_string(dir.join(METRICS_FILE)).unwrap();
        let lines: Vec<Value> = history
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["name"], "validation.mAP");
        assert_eq!(lines[2]["step"], 2);
        assert!(lines[2]["timestamp"].is_string());

        let summary = read(dir.join(SUMMARY_FILE));
        assert_eq!(
            summary["validation.mAP"],
            json!({"count": 2, "last_step": 2, "last_value": 0.75})
        );
        assert_eq!(summary["train/loss"]["count"], 1);
        let run = read(dir.join(RUN_FILE));
        assert_eq!(run["status"], "finished");
        assert!(run["stopped_at"].is_string());
    }

    #[test]
    fn long_runs_keep_one_summary_entry_per_metric() {
        let root = tempfile::tempdir().unwrap();
        let mut tracker = ExperimentTracker::create(root.path(), &json!({})).unwrap();
        for step in 0..5_000 {
            tracker.record(&MetricEvent::new("train/loss", 1.0, step)).unwrap();
            tracker.record(&MetricEvent::new("train/learning_rate", 1e-3, step)).unwrap();
        }
        assert_eq!(tracker.summary.len(), 2);
        assert_eq!(tracker.summary["train/loss"].count, 5_000);

        tracker.flush().unwrap();
        let history = fs::read_to_string(tracker.dir().join(METRICS_FILE)).unwrap();
        assert_eq!(history.lines().count(), 10_000);
    }

    #[test]
    fn concurrent_runs_get_distinct_directories() {
        let root = tempfile::tempdir().unwrap();
        let a = ExperimentTracker::create(root.path(), &json!({})).unwrap();
        let b = ExperimentTracker::create(root.path(), &json!({})).unwrap();
        assert_ne!(a.dir(), b.dir());
    }
}
