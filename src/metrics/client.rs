//! Metrics emission layer.
//!
//! [`MetricsClient`] wraps an unbounded channel sender and never blocks;
//! if the daemon has shut down, events are silently dropped so metrics can
//! never stall the pipeline.

use super::event::{MetricDimensions, MetricEvent};
use std::time::Duration;
use tokio::sync::mpsc;

/// Fire-and-forget handle for emitting metric events.
///
/// Cheap to clone; distribute one per workflow task.
#[derive(Clone)]
pub struct MetricsClient {
    tx: mpsc::UnboundedSender<MetricEvent>,
}

impl MetricsClient {
    pub fn new(tx: mpsc::UnboundedSender<MetricEvent>) -> Self {
        Self { tx }
    }

    /// A client wired to nothing, for tests and tools that do not run the
    /// daemon.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    #[inline]
    fn send(&self, event: MetricEvent) {
        // Daemon may have shut down; fire-and-forget
        let _ = self.tx.send(event);
    }

    #[inline]
    pub fn invocation(&self, dimensions: MetricDimensions) {
        self.send(MetricEvent::Invocation { dimensions });
    }

    #[inline]
    pub fn error(&self, dimensions: MetricDimensions) {
        self.send(MetricEvent::Error { dimensions });
    }

    #[inline]
    pub fn throttle(&self, dimensions: MetricDimensions) {
        self.send(MetricEvent::Throttle { dimensions });
    }

    #[inline]
    pub fn retry(&self, dimensions: MetricDimensions) {
        self.send(MetricEvent::Retry { dimensions });
    }

    #[inline]
    pub fn duration(&self, dimensions: MetricDimensions, duration: Duration) {
        self.send(MetricEvent::Duration {
            dimensions,
            duration,
        });
    }
}
