//! Metrics collection and reporting.
//!
//! Three-layer design so that metrics can never slow the pipeline:
//!
//! 1. **Emission** ([`MetricsClient`]) - cloneable, fire-and-forget
//! 2. **Aggregation** ([`MetricsDaemon`]) - independent async task
//! 3. **Reading** ([`AggregatedMetrics`] snapshots via [`MetricsSystem`])
//!
//! Counters are dimensioned by `(Operation, ModelName, InputFormat)` and
//! cover `Invocations`, `Errors`, `Throttles`, `Retries`, and `Duration`.
//! An external autoscaler watches the `Throttles` counter to size the
//! endpoint fleet.

mod client;
mod daemon;
mod event;

pub use client::MetricsClient;
pub use daemon::{AggregatedMetrics, CounterSet, MetricsDaemon, SharedMetrics};
pub use event::{MetricDimensions, MetricEvent, Operation};

use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The assembled metrics system: channel, daemon task, and shared state.
pub struct MetricsSystem {
    client: MetricsClient,
    state: SharedMetrics,
    cancel: CancellationToken,
    daemon: JoinHandle<()>,
}

impl MetricsSystem {
    /// Starts the aggregation daemon on the current runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state: SharedMetrics = Arc::new(RwLock::new(AggregatedMetrics::default()));
        let cancel = CancellationToken::new();
        let daemon = tokio::spawn(
            MetricsDaemon::new(rx, Arc::clone(&state), cancel.clone()).run(),
        );
        Self {
            client: MetricsClient::new(tx),
            state,
            cancel,
            daemon,
        }
    }

    /// A client for emitting events; clone freely.
    pub fn client(&self) -> MetricsClient {
        self.client.clone()
    }

    /// A point-in-time copy of all counters.
    pub fn snapshot(&self) -> AggregatedMetrics {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Stops the daemon after draining queued events.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.daemon.await;
    }
}
