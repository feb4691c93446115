//! Work-queue coordinator.
//!
//! The runner long-polls the region and image queues (region first, with
//! configurable weights), dispatches messages to the workflows, and owns
//! the messaging side-effects: heartbeating visibility while work is in
//! flight, acknowledging consumed messages, leaving transiently-failed
//! messages for redelivery, and dead-lettering poison messages or those
//! that exceeded the receive budget (marking their ledger records FAILED).

use crate::api::{ImageRequest, RegionRequest};
use crate::config::ServiceConfig;
use crate::endpoint::EndpointTransport;
use crate::image_handler::{finalize_job, ImageProcessor};
use crate::imagery::ImageReader;
use crate::ledger::{
    claim_region, complete_region, fail_job, ClaimOutcome, FeatureStore, Ledger, TileCounts,
};
use crate::metrics::MetricsClient;
use crate::queue::{QueueMessage, WorkQueue};
use crate::region_handler::RegionProcessor;
use crate::sink::{ObjectStore, RecordStream, SinkWriter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The worker's main loop: queues in, workflows out.
pub struct ModelRunner<Q, L, F, I, T, O, K> {
    image_queue: Arc<Q>,
    region_queue: Arc<Q>,
    ledger: Arc<L>,
    feature_store: Arc<F>,
    sinks: Arc<SinkWriter<O, K>>,
    image_processor: Arc<ImageProcessor<Q, L, F, I, T, O, K>>,
    region_processor: Arc<RegionProcessor<L, F, I, T, O, K>>,
    config: Arc<ServiceConfig>,
    cancel: CancellationToken,
}

impl<Q, L, F, I, T, O, K> ModelRunner<Q, L, F, I, T, O, K>
where
    Q: WorkQueue,
    L: Ledger,
    F: FeatureStore,
    I: ImageReader,
    T: EndpointTransport,
    O: ObjectStore,
    K: RecordStream,
{
    /// Wires a runner from its collaborators, building the workflow
    /// processors internally.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        config: Arc<ServiceConfig>,
        image_queue: Arc<Q>,
        region_queue: Arc<Q>,
        ledger: Arc<L>,
        feature_store: Arc<F>,
        imagery: Arc<I>,
        transport: Arc<T>,
        object_store: Arc<O>,
        record_stream: Arc<K>,
        metrics: MetricsClient,
    ) -> Self {
        let sinks = Arc::new(
            SinkWriter::new(object_store, record_stream)
                .with_batch_size(config.output.stream_batch_size),
        );
        let region_processor = Arc::new(RegionProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&feature_store),
            Arc::clone(&imagery),
            transport,
            Arc::clone(&sinks),
            metrics.clone(),
            Arc::clone(&config),
        ));
        let image_processor = Arc::new(ImageProcessor::new(
            Arc::clone(&region_queue),
            Arc::clone(&ledger),
            Arc::clone(&feature_store),
            imagery,
            Arc::clone(&sinks),
            Arc::clone(&region_processor),
            metrics,
            Arc::clone(&config),
        ));
        Self {
            image_queue,
            region_queue,
            ledger,
            feature_store,
            sinks,
            image_processor,
            region_processor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Monitors both work queues until cancelled.
    pub async fn run(&self) {
        info!(worker_id = %self.config.worker_id, "Model runner starting");
        while !self.cancel.is_cancelled() {
            let mut handled = false;
            for _ in 0..self.config.queues.region_poll_weight {
                if self.cancel.is_cancelled() || !self.poll_region().await {
                    break;
                }
                handled = true;
            }
            for _ in 0..self.config.queues.image_poll_weight {
                if self.cancel.is_cancelled() || !self.poll_image().await {
                    break;
                }
                handled = true;
            }
            if !handled {
                // Both queues were empty for a full long-poll; loop again.
                debug!("Work queues idle");
            }
        }
        info!(worker_id = %self.config.worker_id, "Model runner stopped");
    }

    /// Stops the run loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn poll_region(&self) -> bool {
        match self.region_queue.receive(self.config.queues.poll_wait).await {
            Ok(Some(message)) => {
                self.handle_region_message(message).await;
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "Region queue receive failed");
                false
            }
        }
    }

    async fn poll_image(&self) -> bool {
        match self.image_queue.receive(self.config.queues.poll_wait).await {
            Ok(Some(message)) => {
                self.handle_image_message(message).await;
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "Image queue receive failed");
                false
            }
        }
    }

    async fn handle_image_message(&self, message: QueueMessage) {
        let request: ImageRequest = match serde_json::from_str(&message.body) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    message_id = %message.message_id,
                    error = %err,
                    "Unparseable image message, dead-lettering"
                );
                let _ = self.image_queue.dead_letter(&message.message_id).await;
                return;
            }
        };

        if message.receive_count > self.config.queues.max_receive_count {
            warn!(
                job_id = %request.job_id,
                receive_count = message.receive_count,
                "Image message exceeded receive budget, dead-lettering"
            );
            if let Err(err) = fail_job(&*self.ledger, &request.job_id).await {
                warn!(job_id = %request.job_id, error = %err, "Could not mark job FAILED");
            }
            let _ = self.image_queue.dead_letter(&message.message_id).await;
            return;
        }

        let heartbeat = self.heartbeat(&*self.image_queue, &message.message_id);
        tokio::select! {
            biased;
            result = self.image_processor.process(request) => match result {
                Ok(()) => {
                    let _ = self.image_queue.acknowledge(&message.message_id).await;
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "Transient image failure, leaving for redelivery");
                }
                Err(err) => {
                    error!(error = %err, "Unexpected image failure, consuming message");
                    let _ = self.image_queue.acknowledge(&message.message_id).await;
                }
            },
            _ = heartbeat => {
                warn!(
                    message_id = %message.message_id,
                    "Heartbeat failed, abandoning image message"
                );
            }
        }
    }

    async fn handle_region_message(&self, message: QueueMessage) {
        let request: RegionRequest = match serde_json::from_str(&message.body) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    message_id = %message.message_id,
                    error = %err,
                    "Unparseable region message, dead-lettering"
                );
                let _ = self.region_queue.dead_letter(&message.message_id).await;
                return;
            }
        };

        if message.receive_count > self.config.queues.max_receive_count {
            warn!(
                job_id = %request.job_id,
                region_id = %request.region_id,
                receive_count = message.receive_count,
                "Region message exceeded receive budget, dead-lettering"
            );
            self.settle_dead_region(&request).await;
            let _ = self.region_queue.dead_letter(&message.message_id).await;
            return;
        }

        let heartbeat = self.heartbeat(&*self.region_queue, &message.message_id);
        tokio::select! {
            biased;
            result = self.region_processor.process(&request) => match result {
                Ok(disposition) => {
                    let _ = self.region_queue.acknowledge(&message.message_id).await;
                    if disposition.run_finalization {
                        if let Some(job) = &disposition.job {
                            if let Err(err) = finalize_job(
                                &*self.ledger,
                                &*self.feature_store,
                                &self.sinks,
                                job,
                            )
                            .await
                            {
                                error!(job_id = %job.job_id, error = %err, "Job finalization failed");
                            }
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        region_id = %request.region_id,
                        error = %err,
                        "Transient region failure, leaving for redelivery"
                    );
                }
                Err(err) => {
                    error!(
                        region_id = %request.region_id,
                        error = %err,
                        "Unexpected region failure, consuming message"
                    );
                    let _ = self.region_queue.acknowledge(&message.message_id).await;
                }
            },
            _ = heartbeat => {
                warn!(
                    message_id = %message.message_id,
                    "Heartbeat failed, abandoning region"
                );
            }
        }
    }

    /// Marks a dead-lettered region ERROR so the job can still settle.
    async fn settle_dead_region(&self, request: &RegionRequest) {
        let claim = claim_region(
            &*self.ledger,
            &request.job_id,
            &request.region_id,
            &self.config.worker_id,
            self.config.queues.visibility_timeout,
        )
        .await;
        match claim {
            Ok(ClaimOutcome::Claimed { .. }) => {
                match complete_region(
                    &*self.ledger,
                    &request.job_id,
                    &request.region_id,
                    false,
                    TileCounts::default(),
                    0,
                )
                .await
                {
                    Ok(completion) if completion.job_terminal => {
                        if let Err(err) = finalize_job(
                            &*self.ledger,
                            &*self.feature_store,
                            &self.sinks,
                            &completion.job,
                        )
                        .await
                        {
                            error!(job_id = %request.job_id, error = %err, "Finalization failed");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            region_id = %request.region_id,
                            error = %err,
                            "Could not settle dead-lettered region"
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    region_id = %request.region_id,
                    error = %err,
                    "Could not claim dead-lettered region"
                );
            }
        }
    }

    /// Extends message visibility on an interval; returns only when an
    /// extension fails, which abandons the in-flight work.
    async fn heartbeat(&self, queue: &Q, message_id: &str) {
        let interval = self.config.queues.heartbeat_interval();
        let visibility = self.config.queues.visibility_timeout;
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = queue.extend_visibility(message_id, visibility).await {
                warn!(message_id, error = %err, "Visibility heartbeat failed");
                return;
            }
            debug!(message_id, "Extended message visibility");
        }
    }
}
