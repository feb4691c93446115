//! Image workflow: request validation, region planning, fan-out, and job
//! finalization.
//!
//! One worker owns image-level processing for a job: it validates the
//! request, performs the single NEW -> IN_PROGRESS ledger transition, opens
//! the image, plans regions, enqueues regions 1..N-1 for the fleet, and
//! processes region 0 locally. It does NOT wait for peer regions:
//! finalization runs on whichever worker settles the last region.
//!
//! Permanent failures (validation, undecodable image) mark the job FAILED
//! and consume the message; only transient failures escape for redelivery.

use crate::api::{ImageRequest, RegionRequest};
use crate::config::ServiceConfig;
use crate::endpoint::EndpointTransport;
use crate::imagery::{ImageReadError, ImageReader};
use crate::ledger::{
    fail_job, record_output_locations, record_region_plan, start_job, FeatureStore, JobRecord,
    Ledger, LedgerError, StartOutcome,
};
use crate::metrics::{MetricDimensions, MetricsClient, Operation};
use crate::queue::{QueueError, WorkQueue};
use crate::region_handler::{RegionError, RegionProcessor};
use crate::sink::{ObjectStore, RecordStream, SinkError, SinkWriter};
use crate::tiling::plan_regions;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures that abort image-request handling.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Image(#[from] ImageReadError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl ImageError {
    /// Whether queue redelivery can help.
    pub fn is_transient(&self) -> bool {
        match self {
            ImageError::Ledger(LedgerError::Unavailable(_)) => true,
            ImageError::Ledger(_) => false,
            ImageError::Image(err) => err.is_transient(),
            ImageError::Queue(QueueError::Unavailable(_)) => true,
            ImageError::Queue(_) => false,
            ImageError::Region(err) => err.is_transient(),
            ImageError::Sink(SinkError::WriteFailed(_)) => true,
            ImageError::Sink(SinkError::Serialize(_)) => false,
        }
    }
}

/// Emits the user-visible job status log line.
pub fn log_job_status(job: &JobRecord) {
    info!(
        job_id = %job.job_id,
        image_url = %job.image_url,
        model_name = %job.model_name,
        status = %job.status,
        region_success = job.region_success,
        region_count = job.region_count,
        region_error = job.region_error,
        start_time = %job.start_time.to_rfc3339(),
        end_time = job.end_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        "Job status"
    );
}

/// Finalizes a terminal job: aggregates its features, writes the per-job
/// GeoJSON document to object sinks, records the output locations, and
/// emits the completion status log.
///
/// Idempotent: the document write is an overwrite keyed by job id, so a
/// retry after a mid-finalization crash converges on the same output.
pub async fn finalize_job<L, F, O, K>(
    ledger: &L,
    feature_store: &F,
    sinks: &SinkWriter<O, K>,
    job: &JobRecord,
) -> Result<(), ImageError>
where
    L: Ledger,
    F: FeatureStore,
    O: ObjectStore,
    K: RecordStream,
{
    let features = feature_store.job_features(&job.job_id).await?;
    debug!(
        job_id = %job.job_id,
        features = features.len(),
        "Finalizing job output"
    );
    let locations = sinks
        .write_job_document(&job.request.outputs, &job.job_id, &features)
        .await?;
    if !locations.is_empty() {
        record_output_locations(ledger, &job.job_id, locations).await?;
    }
    log_job_status(job);
    Ok(())
}

/// Processes image requests against a set of collaborators.
pub struct ImageProcessor<Q, L, F, I, T, O, K> {
    region_queue: Arc<Q>,
    ledger: Arc<L>,
    feature_store: Arc<F>,
    imagery: Arc<I>,
    sinks: Arc<SinkWriter<O, K>>,
    region_processor: Arc<RegionProcessor<L, F, I, T, O, K>>,
    metrics: MetricsClient,
    config: Arc<ServiceConfig>,
}

impl<Q, L, F, I, T, O, K> ImageProcessor<Q, L, F, I, T, O, K>
where
    Q: WorkQueue,
    L: Ledger,
    F: FeatureStore,
    I: ImageReader,
    T: EndpointTransport,
    O: ObjectStore,
    K: RecordStream,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region_queue: Arc<Q>,
        ledger: Arc<L>,
        feature_store: Arc<F>,
        imagery: Arc<I>,
        sinks: Arc<SinkWriter<O, K>>,
        region_processor: Arc<RegionProcessor<L, F, I, T, O, K>>,
        metrics: MetricsClient,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            region_queue,
            ledger,
            feature_store,
            imagery,
            sinks,
            region_processor,
            metrics,
            config,
        }
    }

    /// Handles one image request from the queue.
    ///
    /// Returning `Ok` means the message is consumed (including permanent
    /// failures, which are recorded on the job); `Err` means redelivery.
    pub async fn process(&self, request: ImageRequest) -> Result<(), ImageError> {
        let dimensions = MetricDimensions::new(
            Operation::ImageProcessing,
            &request.image_processor.name,
            request.tile_format.as_str(),
        );
        let started = Instant::now();

        match start_job(&*self.ledger, JobRecord::new(request.clone())).await? {
            StartOutcome::Started => {
                self.metrics.invocation(dimensions.clone());
                debug!(job_id = %request.job_id, "Started image job");
            }
            StartOutcome::AlreadyRunning => {
                // A redelivered message after a worker died mid-processing:
                // resume. Every downstream step is idempotent.
                info!(job_id = %request.job_id, "Resuming in-flight image job");
            }
            StartOutcome::AlreadyTerminal(status) => {
                info!(
                    job_id = %request.job_id,
                    status = %status,
                    "Duplicate request for finished job, acknowledging"
                );
                return Ok(());
            }
        }

        if let Err(err) = request.validate() {
            warn!(job_id = %request.job_id, error = %err, "Invalid image request");
            return self.fail(&request.job_id, dimensions).await;
        }
        // Validation guarantees a primary URL exists.
        let image_url = request.image_urls[0].clone();

        let info = match self.imagery.open(&image_url).await {
            Ok(info) if info.width > 0 && info.height > 0 => info,
            Ok(_) => {
                warn!(job_id = %request.job_id, image_url, "Image has no pixels");
                return self.fail(&request.job_id, dimensions).await;
            }
            Err(err) if err.is_transient() => return Err(err.into()),
            Err(err) => {
                warn!(
                    job_id = %request.job_id,
                    image_url,
                    error = %err,
                    "Cannot open image"
                );
                return self.fail(&request.job_id, dimensions).await;
            }
        };

        let region_size = request
            .region_size
            .unwrap_or(self.config.processing.region_size);
        let regions = plan_regions(info.width, info.height, region_size);
        record_region_plan(
            &*self.ledger,
            &request.job_id,
            regions.len() as u32,
            info.width,
            info.height,
        )
        .await?;

        let region_requests: Vec<RegionRequest> = regions
            .iter()
            .map(|bounds| RegionRequest::from_image_request(&request, &image_url, *bounds))
            .collect();

        // Fan out every region but the first for parallel pickup.
        for peer in &region_requests[1..] {
            let body = serde_json::to_string(peer)
                .map_err(|err| SinkError::Serialize(err.to_string()))?;
            self.region_queue.send(body).await?;
        }
        info!(
            job_id = %request.job_id,
            image_url,
            width = info.width,
            height = info.height,
            regions = regions.len(),
            enqueued = regions.len().saturating_sub(1),
            "Planned regions"
        );

        // Region 0 runs on this worker.
        let disposition = self.region_processor.process(&region_requests[0]).await?;
        self.metrics.duration(dimensions, started.elapsed());

        if disposition.run_finalization {
            if let Some(job) = &disposition.job {
                finalize_job(&*self.ledger, &*self.feature_store, &self.sinks, job).await?;
            }
        }
        Ok(())
    }

    /// Marks the job FAILED (permanent data error) and consumes the
    /// message.
    async fn fail(
        &self,
        job_id: &str,
        dimensions: MetricDimensions,
    ) -> Result<(), ImageError> {
        let job = fail_job(&*self.ledger, job_id).await?;
        self.metrics.error(dimensions);
        log_job_status(&job);
        Ok(())
    }
}
