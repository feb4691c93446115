//! In-process work queue with visibility-timeout semantics.
//!
//! Backs tests and single-node deployments; the fleet uses an external
//! queue service behind the same trait.

use super::{QueueError, QueueMessage, WorkQueue};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How often a waiting receive re-checks for work.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
}

/// In-memory queue with leases, redelivery, and a dead-letter store.
pub struct InMemoryWorkQueue {
    visibility: Duration,
    ready: Mutex<VecDeque<StoredMessage>>,
    in_flight: Mutex<HashMap<String, (StoredMessage, Instant)>>,
    dead: Mutex<Vec<QueueMessage>>,
    next_id: AtomicU64,
}

impl InMemoryWorkQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            visibility,
            ready: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            dead: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Messages that have been dead-lettered so far.
    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.dead.lock().expect("dead-letter store poisoned").clone()
    }

    /// Number of messages waiting for delivery (not leased).
    pub fn ready_len(&self) -> usize {
        self.ready.lock().expect("ready queue poisoned").len()
    }

    /// Returns expired leases to the ready queue.
    fn reclaim_expired(&self) {
        let now = Instant::now();
        let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
        let expired: Vec<String> = in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut ready = self.ready.lock().expect("ready queue poisoned");
        for id in expired {
            if let Some((message, _)) = in_flight.remove(&id) {
                ready.push_back(message);
            }
        }
    }
}

impl WorkQueue for InMemoryWorkQueue {
    async fn send(&self, body: String) -> Result<(), QueueError> {
        let message = StoredMessage {
            message_id: format!("m-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            body,
            receive_count: 0,
        };
        self.ready
            .lock()
            .expect("ready queue poisoned")
            .push_back(message);
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            self.reclaim_expired();

            let leased = {
                let mut ready = self.ready.lock().expect("ready queue poisoned");
                ready.pop_front()
            };
            if let Some(mut message) = leased {
                message.receive_count += 1;
                let delivered = QueueMessage {
                    message_id: message.message_id.clone(),
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                };
                self.in_flight
                    .lock()
                    .expect("in-flight map poisoned")
                    .insert(
                        message.message_id.clone(),
                        (message, Instant::now() + self.visibility),
                    );
                return Ok(Some(delivered));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, message_id: &str) -> Result<(), QueueError> {
        self.in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(message_id)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotInFlight(message_id.to_string()))
    }

    async fn extend_visibility(
        &self,
        message_id: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
        match in_flight.get_mut(message_id) {
            Some((_, deadline)) => {
                *deadline = Instant::now() + timeout;
                Ok(())
            }
            None => Err(QueueError::NotInFlight(message_id.to_string())),
        }
    }

    async fn dead_letter(&self, message_id: &str) -> Result<(), QueueError> {
        let removed = self
            .in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(message_id);
        match removed {
            Some((message, _)) => {
                self.dead
                    .lock()
                    .expect("dead-letter store poisoned")
                    .push(QueueMessage {
                        message_id: message.message_id,
                        body: message.body,
                        receive_count: message.receive_count,
                    });
                Ok(())
            }
            None => Err(QueueError::NotInFlight(message_id.to_string())),
        }
    }
}
