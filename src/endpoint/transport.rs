//! HTTP transport abstraction for model endpoints.
//!
//! The transport is a trait so the retry-driving client can be exercised
//! against scripted responses in tests; [`ReqwestTransport`] is the real
//! implementation used in deployments.

use bytes::Bytes;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// A raw endpoint response: status plus body bytes.
///
/// Non-2xx statuses are returned here rather than as errors; the client
/// decides what is retryable.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Transport-level failures (no HTTP status was obtained).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Could not connect within the dial timeout. Retryable.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request exceeded its timeout. Retryable.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Any other request failure. Retryable.
    #[error("request failed: {0}")]
    Other(String),
}

/// Posts tile payloads to a model endpoint.
pub trait EndpointTransport: Send + Sync + 'static {
    fn invoke(
        &self,
        payload: Bytes,
        content_type: &str,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// Real transport posting to `/invocations` via reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    url: String,
}

impl ReqwestTransport {
    /// Default dial timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default whole-request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a transport for the given endpoint URL.
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_timeouts(
            url,
            Self::DEFAULT_CONNECT_TIMEOUT,
            Self::DEFAULT_REQUEST_TIMEOUT,
        )
    }

    pub fn with_timeouts(
        url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|err| TransportError::Other(format!("failed to create HTTP client: {err}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl EndpointTransport for ReqwestTransport {
    async fn invoke(
        &self,
        payload: Bytes,
        content_type: &str,
    ) -> Result<TransportResponse, TransportError> {
        trace!(url = %self.url, bytes = payload.len(), "Model invocation starting");

        let response = match self
            .client
            .post(&self.url)
            .header("Content-Type", content_type)
            .body(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_connect() => {
                warn!(url = %self.url, error = %err, "Endpoint connection failed");
                return Err(TransportError::Connect(err.to_string()));
            }
            Err(err) if err.is_timeout() => {
                warn!(url = %self.url, error = %err, "Endpoint request timed out");
                return Err(TransportError::Timeout(err.to_string()));
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "Endpoint request failed");
                return Err(TransportError::Other(err.to_string()));
            }
        };

        let status = response.status().as_u16();
        debug!(url = %self.url, status, "Model endpoint responded");
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Other(format!("failed to read response: {err}")))?;
        Ok(TransportResponse { status, body })
    }
}

/// Transport that replays a scripted sequence of responses.
///
/// Used by unit and integration tests to exercise retry, throttle, and
/// failure paths without a live endpoint. Once the script is exhausted the
/// last entry repeats.
pub struct ScriptedTransport {
    script: Mutex<Vec<Result<TransportResponse, TransportError>>>,
    calls: Mutex<u32>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(0),
        }
    }

    /// A transport that always answers 200 with the given body.
    pub fn always_ok(body: impl Into<Bytes>) -> Self {
        Self::new(vec![Ok(TransportResponse {
            status: 200,
            body: body.into(),
        })])
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().expect("call counter poisoned")
    }
}

impl EndpointTransport for ScriptedTransport {
    async fn invoke(
        &self,
        _payload: Bytes,
        _content_type: &str,
    ) -> Result<TransportResponse, TransportError> {
        *self.calls.lock().expect("call counter poisoned") += 1;
        let mut script = self.script.lock().expect("script poisoned");
        if script.len() > 1 {
            script.remove(0)
        } else {
            script
                .first()
                .cloned()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_sequence_then_repeat() {
        let transport = ScriptedTransport::new(vec![
            Ok(TransportResponse {
                status: 429,
                body: Bytes::new(),
            }),
            Ok(TransportResponse {
                status: 200,
                body: Bytes::from_static(b"done"),
            }),
        ]);

        let first = transport.invoke(Bytes::new(), "image/png").await.unwrap();
        assert_eq!(first.status, 429);
        let second = transport.invoke(Bytes::new(), "image/png").await.unwrap();
        assert_eq!(second.status, 200);
        // Last entry repeats
        let third = transport.invoke(Bytes::new(), "image/png").await.unwrap();
        assert_eq!(third.status, 200);
        assert_eq!(transport.call_count(), 3);
    }
}
