//! Model endpoint invocation.
//!
//! The endpoint client sends encoded tile payloads to a remote inference
//! endpoint and parses GeoJSON FeatureCollection responses. Retry is driven
//! from typed error kinds rather than exception catching:
//!
//! - connection errors, timeouts, 5xx, and 429 retry with exponential
//!   backoff and jitter, bounded per tile
//! - 429 additionally counts a `Throttles` metric the autoscaler watches
//! - other 4xx, oversize payloads, and unparseable responses are permanent
//!   for the tile; the region continues without it

mod client;
mod retry;
mod transport;

pub use client::{EndpointError, ModelClient, MAX_PAYLOAD_BYTES};
pub use retry::RetryPolicy;
pub use transport::{
    EndpointTransport, ReqwestTransport, ScriptedTransport, TransportError, TransportResponse,
};
