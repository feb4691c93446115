//! Metric events and dimensions.
//!
//! Every event is dimensioned by `(Operation, ModelName, InputFormat)` so
//! that counters roll up per model endpoint and tile format. Events are
//! fire-and-forget: producers send them to the daemon without waiting.

use std::time::Duration;

/// The units of work that report metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ImageProcessing,
    RegionProcessing,
    TileGeneration,
    TileProcessing,
    ModelInvocation,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ImageProcessing => "ImageProcessing",
            Operation::RegionProcessing => "RegionProcessing",
            Operation::TileGeneration => "TileGeneration",
            Operation::TileProcessing => "TileProcessing",
            Operation::ModelInvocation => "ModelInvocation",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dimension tuple identifying one counter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricDimensions {
    pub operation: Operation,
    pub model_name: String,
    pub input_format: String,
}

impl MetricDimensions {
    pub fn new(
        operation: Operation,
        model_name: impl Into<String>,
        input_format: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            model_name: model_name.into(),
            input_format: input_format.into(),
        }
    }
}

/// Events emitted by the workflows to the metrics daemon.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    /// One invocation of the dimensioned operation.
    Invocation { dimensions: MetricDimensions },

    /// The operation failed terminally.
    Error { dimensions: MetricDimensions },

    /// The remote endpoint throttled the operation (429 or backpressure).
    Throttle { dimensions: MetricDimensions },

    /// One retry attempt after a retryable failure.
    Retry { dimensions: MetricDimensions },

    /// Wall-clock duration of one completed operation.
    Duration {
        dimensions: MetricDimensions,
        duration: Duration,
    },
}
