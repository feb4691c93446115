//! Work queue contract.
//!
//! The image and region queues are external message queues with visibility
//! timeouts: a received message is invisible to other workers until it is
//! acknowledged, its visibility is extended by a heartbeat, or the timeout
//! lapses and it is redelivered. Dead-letter policy lives in the
//! coordinator, which inspects each message's receive count; the queue only
//! provides the mechanics.

mod memory;

pub use memory::InMemoryWorkQueue;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// A message leased from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    /// How many times this message has been delivered, this lease included.
    pub receive_count: u32,
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Transport failure. Transient; the poll loop retries.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// Operations on a message whose lease this worker no longer holds.
    #[error("message {0} is not in flight")]
    NotInFlight(String),
}

/// A message queue with visibility-timeout leasing.
pub trait WorkQueue: Send + Sync + 'static {
    /// Enqueues a message body.
    fn send(&self, body: String) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Long-polls for one message, waiting up to `wait`.
    ///
    /// A returned message is leased to this worker for the queue's
    /// visibility timeout.
    fn receive(
        &self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<QueueMessage>, QueueError>> + Send;

    /// Removes a successfully processed message.
    fn acknowledge(
        &self,
        message_id: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Extends the lease on an in-flight message (heartbeat).
    fn extend_visibility(
        &self,
        message_id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Moves an in-flight message to the dead-letter store.
    fn dead_letter(
        &self,
        message_id: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;
}
