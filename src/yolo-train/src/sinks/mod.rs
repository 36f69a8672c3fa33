//! Scalar metric sinks.
//!
//! Training emits [`MetricEvent`]s through a [`MetricHub`]. Every sink owns a
//! worker thread fed by a bounded channel, so a slow sink never stalls the
//! batch loop: when its queue is full the event is dropped and counted.

pub mod dashboard;
pub mod scalars;
pub mod tracking;

use crate::config::RunConfig;

use log::{debug, error, warn};
use serde::Serialize;
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle},
};
use thiserror::Error;

pub use dashboard::DashboardSink;
pub use scalars::ScalarLogSink;
pub use tracking::ExperimentTracker;

/// Events queued per sink before new ones are dropped.
pub const SINK_QUEUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub step: u64,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, value: f64, step: u64) -> Self {
        Self {
            name: name.into(),
            value,
            step,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Finished,
    Failed,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SinkError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| SinkError::Io { path, source }
    }
}

pub trait ScalarSink: Send + 'static {
    fn name(&self) -> &str;

    fn record(&mut self, event: &MetricEvent) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called once, after the last event.
    fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
        let _ = outcome;
        self.flush()
    }
}

enum Message {
    Event(MetricEvent),
    Close(RunOutcome),
}

struct SinkWorker {
    name: String,
    tx: SyncSender<Message>,
    handle: JoinHandle<()>,
}

fn run_worker(mut sink: Box<dyn ScalarSink>, rx: Receiver<Message>) {
    let mut outcome = RunOutcome::Failed;
    for message in rx {
        match message {
            Message::Event(event) => {
                if let Err(e) = sink.record(&event) {
                    error!("Sink `{}` failed to record {}: {e}", sink.name(), event.name);
                }
            }
            Message::Close(o) => {
                outcome = o;
                break;
            }
        }
    }
    if let Err(e) = sink.close(outcome) {
        error!("Sink `{}` failed to close: {e}", sink.name());
    }
}

/// Fans metric events out to every registered sink.
#[derive(Default)]
pub struct MetricHub {
    workers: Vec<SinkWorker>,
    dropped: Arc<AtomicU64>,
}

impl MetricHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks selected by the run configuration, plus the dashboard when given.
    pub fn from_config(
        config: &RunConfig,
        dashboard: Option<Sender<MetricEvent>>,
    ) -> Result<Self, SinkError> {
        let mut hub = Self::new();
        hub.register(ScalarLogSink::create(&config.logdir)?);
        if let Some(root) = &config.tracking_dir {
            hub.register(ExperimentTracker::create(root, config)?);
        }
        if let Some(tx) = dashboard {
            hub.register(DashboardSink::new(tx));
        }
        Ok(hub)
    }

    pub fn register(&mut self, sink: impl ScalarSink) {
        self.register_with_capacity(sink, SINK_QUEUE);
    }

    pub fn register_with_capacity(&mut self, sink: impl ScalarSink, capacity: usize) {
        let name = sink.name().to_string();
        let (tx, rx) = mpsc::sync_channel(capacity);
        let boxed: Box<dyn ScalarSink> = Box::new(sink);
        let handle = thread::spawn(move || run_worker(boxed, rx));
        debug!("Registered metric sink `{name}`");
        self.workers.push(SinkWorker { name, tx, handle });
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name.as_str()).collect()
    }

    /// Queues the event on every sink without blocking.
    pub fn emit(&self, name: &str, value: f64, step: u64) {
        for worker in &self.workers {
            let event = MetricEvent::new(name, value, step);
            match worker.tx.try_send(Message::Event(event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Sink `{}` stopped, dropping {name}", worker.name);
                }
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drains every queue, closes the sinks and joins their threads.
    pub fn shutdown(self, outcome: RunOutcome) -> u64 {
        for worker in self.workers {
            // A blocking send: the close marker must not be dropped.
            if worker.tx.send(Message::Close(outcome)).is_err() {
                debug!("Sink `{}` already stopped", worker.name);
            }
            drop(worker.tx);
            if worker.handle.join().is_err() {
                error!("Sink `{}` worker panicked", worker.name);
            }
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("{dropped} metric events were dropped by full sink queues");
        }
        dropped
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Test sink storing every event, and the outcome it was closed with.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub events: Arc<Mutex<Vec<MetricEvent>>>,
        pub closed: Arc<Mutex<Option<RunOutcome>>>,
    }

    impl ScalarSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn record(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
            *self.closed.lock().unwrap() = Some(outcome);
            Ok(())
        }
    }

    struct FailingSink;

    impl ScalarSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn record(&mut self, _event: &MetricEvent) -> Result<(), SinkError> {
            Err(SinkError::io("failing.jsonl")(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn every_sink_sees_every_event_in_order() {
        let first = RecordingSink::default();
        let second = RecordingSink::default();
        let mut hub = MetricHub::new();
        hub.register(first.clone());
        hub.register(second.clone());

        hub.emit("train/loss", 1.5, 0);
        hub.emit("validation.mAP", 0.25, 1);
        assert_eq!(hub.shutdown(RunOutcome::Finished), 0);

        for sink in [first, second] {
            let events = sink.events.lock().unwrap();
            let names: Vec<_> = events.iter().map(|e| (e.name.as_str(), e.step)).collect();
            assert_eq!(names, [("train/loss", 0), ("validation.mAP", 1)]);
            assert_eq!(*sink.closed.lock().unwrap(), Some(RunOutcome::Finished));
        }
    }

    #[test]
    fn failing_sink_does_not_affect_others() {
        let good = RecordingSink::default();
        let mut hub = MetricHub::new();
        hub.register(FailingSink);
        hub.register(good.clone());
        hub.emit("train/loss", 1.0, 3);
        hub.shutdown(RunOutcome::Failed);
        assert_eq!(good.events.lock().unwrap().len(), 1);
        assert_eq!(*good.closed.lock().unwrap(), Some(RunOutcome::Failed));
    }

    /// Blocks in `record` until released, so the queue behind it fills up.
    struct StalledSink(Arc<Mutex<()>>);

    impl ScalarSink for StalledSink {
        fn name(&self) -> &str {
            "stalled"
        }

        fn record(&mut self, _event: &MetricEvent) -> Result<(), SinkError> {
            let _guard = self.0.lock().unwrap();
            Ok(())
        }
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let mut hub = MetricHub::new();
        hub.register_with_capacity(StalledSink(gate.clone()), 1);

        for step in 0..10 {
            hub.emit("train/loss", 0.0, step);
        }
        // At most one event in the worker and one queued.
        assert!(hub.dropped() >= 8);
        drop(held);
        hub.shutdown(RunOutcome::Finished);
    }
}
