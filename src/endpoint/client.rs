//! Retry-driving model client.

use super::retry::RetryPolicy;
use super::transport::{EndpointTransport, TransportError};
use crate::feature::{normalize_features, Feature, FeatureCollection};
use crate::metrics::{MetricDimensions, MetricsClient, Operation};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Hard ceiling on a single tile payload.
pub const MAX_PAYLOAD_BYTES: usize = 6 * 1024 * 1024;

/// Terminal failures of one tile's inference call.
///
/// Every variant is permanent for the tile that produced it; transient
/// conditions are consumed by the retry loop and never escape.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Payload at or over the endpoint limit. Not retried.
    #[error("tile payload of {0} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit")]
    PayloadTooLarge(usize),

    /// Non-throttle 4xx: the endpoint rejected this tile outright.
    #[error("endpoint rejected request with status {0}")]
    Rejected(u16),

    /// The retry budget ran out on throttles, 5xx, or connection errors.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A 200 response that is not a parseable FeatureCollection.
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

/// Classified outcome of a single attempt, driving the retry loop.
enum Attempt {
    Success(Bytes),
    Throttled,
    Retryable(String),
    Fatal(EndpointError),
}

/// Invokes a model endpoint for tile payloads with bounded retry.
///
/// One client is built per region; it carries the metric dimensions for the
/// model and input format so every counter lands on the right tuple.
pub struct ModelClient<T> {
    transport: Arc<T>,
    policy: RetryPolicy,
    dimensions: MetricDimensions,
    metrics: MetricsClient,
}

impl<T: EndpointTransport> ModelClient<T> {
    pub fn new(
        transport: Arc<T>,
        policy: RetryPolicy,
        model_name: impl Into<String>,
        input_format: impl Into<String>,
        metrics: MetricsClient,
    ) -> Self {
        Self {
            transport,
            policy,
            dimensions: MetricDimensions::new(Operation::ModelInvocation, model_name, input_format),
            metrics,
        }
    }

    /// Sends an encoded tile to the endpoint and returns its normalized
    /// detections.
    ///
    /// Retries connection errors, 5xx, and 429 with exponential backoff up
    /// to the policy's attempt budget. 429 additionally counts a throttle so
    /// the autoscaler can see endpoint pressure.
    pub async fn detect_features(
        &self,
        payload: Bytes,
        content_type: &str,
    ) -> Result<Vec<Feature>, EndpointError> {
        if payload.len() >= MAX_PAYLOAD_BYTES {
            self.metrics.error(self.dimensions.clone());
            return Err(EndpointError::PayloadTooLarge(payload.len()));
        }

        self.metrics.invocation(self.dimensions.clone());
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut last_error = String::new();

        loop {
            attempts += 1;
            match self.attempt(payload.clone(), content_type).await {
                Attempt::Success(body) => {
                    self.metrics
                        .duration(self.dimensions.clone(), started.elapsed());
                    return self.parse_response(&body);
                }
                Attempt::Throttled => {
                    self.metrics.throttle(self.dimensions.clone());
                    last_error = "endpoint throttled (429)".to_string();
                }
                Attempt::Retryable(message) => {
                    last_error = message;
                }
                Attempt::Fatal(error) => {
                    self.metrics.error(self.dimensions.clone());
                    return Err(error);
                }
            }

            if attempts >= self.policy.max_attempts {
                self.metrics.error(self.dimensions.clone());
                warn!(
                    model = %self.dimensions.model_name,
                    attempts,
                    error = %last_error,
                    "Model invocation retries exhausted"
                );
                return Err(EndpointError::RetriesExhausted {
                    attempts,
                    last_error,
                });
            }

            self.metrics.retry(self.dimensions.clone());
            let delay = self.policy.backoff_delay(attempts - 1);
            debug!(
                model = %self.dimensions.model_name,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Retrying model invocation"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, payload: Bytes, content_type: &str) -> Attempt {
        match self.transport.invoke(payload, content_type).await {
            Ok(response) if (200..300).contains(&response.status) => {
                Attempt::Success(response.body)
            }
            Ok(response) if response.status == 429 => Attempt::Throttled,
            Ok(response) if (500..600).contains(&response.status) => {
                Attempt::Retryable(format!("endpoint returned {}", response.status))
            }
            Ok(response) => Attempt::Fatal(EndpointError::Rejected(response.status)),
            Err(TransportError::Connect(message))
            | Err(TransportError::Timeout(message))
            | Err(TransportError::Other(message)) => Attempt::Retryable(message),
        }
    }

    fn parse_response(&self, body: &[u8]) -> Result<Vec<Feature>, EndpointError> {
        let collection: FeatureCollection = serde_json::from_slice(body).map_err(|err| {
            self.metrics.error(self.dimensions.clone());
            EndpointError::InvalidResponse(err.to_string())
        })?;
        let mut features = collection.features;
        normalize_features(&mut features);
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::transport::{ScriptedTransport, TransportResponse};
    use crate::metrics::MetricsSystem;

    fn ok(body: &str) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: 200,
            body: Bytes::from(body.to_string()),
        })
    }

    fn status(code: u16) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: code,
            body: Bytes::new(),
        })
    }

    const EMPTY_COLLECTION: &str = r#"{"type":"FeatureCollection","features":[]}"#;

    fn client(transport: ScriptedTransport, metrics: MetricsClient) -> ModelClient<ScriptedTransport> {
        ModelClient::new(
            Arc::new(transport),
            RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            "detector",
            "PNG",
            metrics,
        )
    }

    fn dims() -> MetricDimensions {
        MetricDimensions::new(Operation::ModelInvocation, "detector", "PNG")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_parses_features() {
        let body = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":null,
             "properties":{"bounds_imcoords":[0.0,0.0,5.0,5.0],"feature_types":{"ship":0.8}}}
        ]}"#;
        let client = client(ScriptedTransport::always_ok(body.to_string()), MetricsClient::disconnected());

        let features = client
            .detect_features(Bytes::from_static(b"tile"), "image/png")
            .await
            .unwrap();
        assert_eq!(features.len(), 1);
        // Deprecated fields are normalized on the way in
        assert_eq!(features[0].properties.image_bbox, Some([0.0, 0.0, 5.0, 5.0]));
        assert_eq!(features[0].properties.feature_classes[0].iri, "ship");
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_then_success() {
        let system = MetricsSystem::start();
        let transport = ScriptedTransport::new(vec![
            status(429),
            status(429),
            status(429),
            ok(EMPTY_COLLECTION),
        ]);
        let client = client(transport, system.client());

        let features = client
            .detect_features(Bytes::from_static(b"tile"), "image/png")
            .await
            .unwrap();
        assert!(features.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let counters = system.snapshot().get(&dims());
        assert_eq!(counters.throttles, 3);
        assert_eq!(counters.retries, 3);
        assert_eq!(counters.errors, 0);
        assert_eq!(counters.invocations, 1);
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_retries() {
        let system = MetricsSystem::start();
        let transport = ScriptedTransport::new(vec![status(500)]);
        let client = client(transport, system.client());

        let result = client
            .detect_features(Bytes::from_static(b"tile"), "image/png")
            .await;
        assert!(matches!(
            result,
            Err(EndpointError::RetriesExhausted { attempts: 5, .. })
        ));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let counters = system.snapshot().get(&dims());
        assert_eq!(counters.retries, 4);
        assert_eq!(counters.errors, 1);
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_permanent() {
        let transport = ScriptedTransport::new(vec![status(422)]);
        let scripted = Arc::new(transport);
        let client = ModelClient::new(
            Arc::clone(&scripted),
            RetryPolicy::default(),
            "detector",
            "PNG",
            MetricsClient::disconnected(),
        );

        let result = client
            .detect_features(Bytes::from_static(b"tile"), "image/png")
            .await;
        assert!(matches!(result, Err(EndpointError::Rejected(422))));
        // No retries for a non-429 4xx
        assert_eq!(scripted.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversize_payload_not_sent() {
        let scripted = Arc::new(ScriptedTransport::always_ok(EMPTY_COLLECTION));
        let client = ModelClient::new(
            Arc::clone(&scripted),
            RetryPolicy::default(),
            "detector",
            "PNG",
            MetricsClient::disconnected(),
        );

        let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_BYTES + 1]);
        let result = client.detect_features(payload, "image/png").await;
        assert!(matches!(result, Err(EndpointError::PayloadTooLarge(_))));
        assert_eq!(scripted.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_retry() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect("refused".to_string())),
            Err(TransportError::Timeout("deadline".to_string())),
            ok(EMPTY_COLLECTION),
        ]);
        let client = client(transport, MetricsClient::disconnected());

        let features = client
            .detect_features(Bytes::from_static(b"tile"), "image/png")
            .await
            .unwrap();
        assert!(features.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_json_is_permanent() {
        let client = client(
            ScriptedTransport::always_ok("not json"),
            MetricsClient::disconnected(),
        );
        let result = client
            .detect_features(Bytes::from_static(b"tile"), "image/png")
            .await;
        assert!(matches!(result, Err(EndpointError::InvalidResponse(_))));
    }
}
