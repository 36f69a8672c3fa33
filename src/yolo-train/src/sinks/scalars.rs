use crate::{
    common::SCALARS_FILE,
    sinks::{MetricEvent, ScalarSink, SinkError},
};

use chrono::Utc;
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Serialize)]
struct ScalarLine<'a> {
    name: &'a str,
    value: f64,
    step: u64,
    /// Seconds since the Unix epoch.
    wall_time: f64,
}

/// Appends one JSON object per event to `<logdir>/scalars.jsonl`.
pub struct ScalarLogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarLogSink {
    pub fn create(logdir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let logdir = logdir.as_ref();
        fs::create_dir_all(logdir).map_err(SinkError::io(logdir))?;
        let path = logdir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(SinkError::io(&path))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for ScalarLogSink {
    fn name(&self) -> &str {
        "scalars"
    }

    fn record(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
        let line = ScalarLine {
            name: &event.name,
            value: event.value,
            step: event.step,
            wall_time: Utc::now().timestamp_micros() as f64 / 1e6,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer
            .write_all(b"\n")
            .map_err(SinkError::io(&self.path))
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().map_err(SinkError::io(&self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ScalarLogSink::create(dir.path().join("logs")).unwrap();
        sink.record(&MetricEvent::new("train/loss", 2.5, 0)).unwrap();
        sink.record(&MetricEvent::new("train-loss", 2.0, 1)).unwrap();
        sink.flush().unwrap();

        let text = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["name"], "train/loss");
        assert_eq!(lines[0]["value"], 2.5);
        assert_eq!(lines[1]["step"], 1);
        assert!(lines[1]["wall_time"].as_f64().unwrap() > 0.0);
    }
}
