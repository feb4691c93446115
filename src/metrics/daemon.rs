//! Metrics aggregation layer.

use super::event::{MetricDimensions, MetricEvent, Operation};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counters accumulated for one dimension tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSet {
    pub invocations: u64,
    pub errors: u64,
    pub throttles: u64,
    pub retries: u64,
    pub duration_total_us: u64,
    pub duration_samples: u64,
}

impl CounterSet {
    fn merge(&mut self, other: &CounterSet) {
        self.invocations += other.invocations;
        self.errors += other.errors;
        self.throttles += other.throttles;
        self.retries += other.retries;
        self.duration_total_us += other.duration_total_us;
        self.duration_samples += other.duration_samples;
    }
}

/// All counters, keyed by dimension tuple.
#[derive(Debug, Clone, Default)]
pub struct AggregatedMetrics {
    counters: HashMap<MetricDimensions, CounterSet>,
}

impl AggregatedMetrics {
    /// Counters for an exact dimension tuple.
    pub fn get(&self, dimensions: &MetricDimensions) -> CounterSet {
        self.counters.get(dimensions).copied().unwrap_or_default()
    }

    /// Counters summed across all models/formats for one operation.
    pub fn operation_total(&self, operation: Operation) -> CounterSet {
        let mut total = CounterSet::default();
        for (dimensions, counters) in &self.counters {
            if dimensions.operation == operation {
                total.merge(counters);
            }
        }
        total
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricDimensions, &CounterSet)> {
        self.counters.iter()
    }

    fn apply(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::Invocation { dimensions } => {
                self.counters.entry(dimensions).or_default().invocations += 1;
            }
            MetricEvent::Error { dimensions } => {
                self.counters.entry(dimensions).or_default().errors += 1;
            }
            MetricEvent::Throttle { dimensions } => {
                self.counters.entry(dimensions).or_default().throttles += 1;
            }
            MetricEvent::Retry { dimensions } => {
                self.counters.entry(dimensions).or_default().retries += 1;
            }
            MetricEvent::Duration {
                dimensions,
                duration,
            } => {
                let counters = self.counters.entry(dimensions).or_default();
                counters.duration_total_us += duration.as_micros() as u64;
                counters.duration_samples += 1;
            }
        }
    }
}

/// Shared read handle over the aggregated state.
pub type SharedMetrics = Arc<RwLock<AggregatedMetrics>>;

/// Consumes metric events and maintains [`AggregatedMetrics`].
///
/// Runs as an independent task; producers never wait on it.
pub struct MetricsDaemon {
    rx: mpsc::UnboundedReceiver<MetricEvent>,
    state: SharedMetrics,
    cancel: CancellationToken,
}

impl MetricsDaemon {
    pub fn new(
        rx: mpsc::UnboundedReceiver<MetricEvent>,
        state: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self { rx, state, cancel }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Drain whatever is already queued before exiting
                    while let Ok(event) = self.rx.try_recv() {
                        self.apply(event);
                    }
                    break;
                }
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.apply(event),
                        None => break,
                    }
                }
            }
        }
        debug!("Metrics daemon stopped");
    }

    fn apply(&self, event: MetricEvent) {
        if let Ok(mut state) = self.state.write() {
            state.apply(event);
        }
    }
}
