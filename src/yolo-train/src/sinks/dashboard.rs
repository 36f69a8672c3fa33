use crate::sinks::{MetricEvent, ScalarSink, SinkError};

use log::debug;
use std::sync::mpsc::Sender;

/// Forwards events to the terminal dashboard running on the main thread.
///
/// Closing the dashboard does not stop training: once the receiver is gone the
/// sink drops every later event.
pub struct DashboardSink {
    tx: Sender<MetricEvent>,
    closed: bool,
}

impl DashboardSink {
    pub fn new(tx: Sender<MetricEvent>) -> Self {
        Self { tx, closed: false }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ScalarSink for DashboardSink {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn record(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        if self.tx.send(event.clone()).is_err() {
            debug!("Dashboard closed, no longer forwarding metrics");
            self.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn closed_dashboard_stops_forwarding_quietly() {
        let (tx, rx) = mpsc::channel();
        let mut sink = DashboardSink::new(tx);
        sink.record(&MetricEvent::new("train/loss", 2.0, 0)).unwrap();
        assert_eq!(rx.recv().unwrap().value, 2.0);
        assert!(!sink.is_closed());

        drop(rx);
        sink.record(&MetricEvent::new("train/loss", 1.5, 1)).unwrap();
        assert!(sink.is_closed());
        sink.record(&MetricEvent::new("train/loss", 1.0, 2)).unwrap();
        sink.close(crate::sinks::RunOutcome::Finished).unwrap();
    }
}
