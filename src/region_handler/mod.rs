//! Region workflow: CLAIMED -> TILING -> DISPATCHING -> AGGREGATING ->
//! {DONE, ERROR}.
//!
//! A region is the unit of work one worker owns end to end. The workflow
//! claims the region in the ledger, enumerates its tiles, dispatches them to
//! the model endpoint from a bounded pool, lifts and deduplicates the
//! resulting features, persists them, and settles the region against the
//! job. The worker whose settlement is the job's terminal transition is told
//! so in the returned disposition and must run job finalization.
//!
//! Tile failures never fail a region unless the failure rate crosses the
//! configured threshold; a failed region never fails the job directly (the
//! job aggregates region outcomes into SUCCESS/PARTIAL/FAILED).

use crate::api::RegionRequest;
use crate::codec::encode_tile;
use crate::config::ServiceConfig;
use crate::distill::{DistillationOptions, FeatureSelector};
use crate::endpoint::{EndpointTransport, ModelClient};
use crate::feature::Feature;
use crate::imagery::{ImageReadError, ImageReader};
use crate::ledger::{
    claim_region, complete_region, ClaimOutcome, FeatureStore, JobRecord, Ledger, LedgerError,
    RegionStatus, TileCounts,
};
use crate::lift::FeatureLifter;
use crate::metrics::{MetricDimensions, MetricsClient, Operation};
use crate::sink::{ObjectStore, RecordStream, SinkError, SinkWriter};
use crate::tiling::{PixelRect, TileGrid, TilingError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Failures that abort region processing.
///
/// Only transient failures should escape to the coordinator (which leaves
/// the message for redelivery); permanent conditions settle the region as
/// ERROR instead.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Image(#[from] ImageReadError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Tiling(#[from] TilingError),
}

impl RegionError {
    /// Whether queue redelivery can help.
    pub fn is_transient(&self) -> bool {
        match self {
            RegionError::Ledger(LedgerError::Unavailable(_)) => true,
            RegionError::Ledger(_) => false,
            RegionError::Image(err) => err.is_transient(),
            RegionError::Sink(SinkError::WriteFailed(_)) => true,
            RegionError::Sink(SinkError::Serialize(_)) => false,
            RegionError::Tiling(_) => false,
        }
    }
}

/// What a region message turned into.
#[derive(Debug)]
pub struct RegionDisposition {
    /// The job record after this region's settlement, when one was read.
    pub job: Option<JobRecord>,
    /// True when the caller must run job finalization: either this
    /// settlement wrote the terminal status, or a duplicate delivery found a
    /// terminal job whose output document was never written (worker died
    /// mid-finalization).
    pub run_finalization: bool,
    /// True when the message was a duplicate (region settled or held).
    pub skipped: bool,
}

impl RegionDisposition {
    fn held() -> Self {
        Self {
            job: None,
            run_finalization: false,
            skipped: true,
        }
    }
}

/// One tile's journey: read, encode, invoke, lift.
struct TileOutcome {
    features: Vec<Feature>,
    lift_errors: usize,
}

/// Processes region requests against a set of collaborators.
pub struct RegionProcessor<L, F, I, T, O, K> {
    ledger: Arc<L>,
    feature_store: Arc<F>,
    imagery: Arc<I>,
    transport: Arc<T>,
    sinks: Arc<SinkWriter<O, K>>,
    metrics: MetricsClient,
    config: Arc<ServiceConfig>,
}

impl<L, F, I, T, O, K> RegionProcessor<L, F, I, T, O, K>
where
    L: Ledger,
    F: FeatureStore,
    I: ImageReader,
    T: EndpointTransport,
    O: ObjectStore,
    K: RecordStream,
{
    pub fn new(
        ledger: Arc<L>,
        feature_store: Arc<F>,
        imagery: Arc<I>,
        transport: Arc<T>,
        sinks: Arc<SinkWriter<O, K>>,
        metrics: MetricsClient,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            ledger,
            feature_store,
            imagery,
            transport,
            sinks,
            metrics,
            config,
        }
    }

    /// Runs the region state machine for one request.
    pub async fn process(&self, request: &RegionRequest) -> Result<RegionDisposition, RegionError> {
        let dimensions = MetricDimensions::new(
            Operation::RegionProcessing,
            &request.image_processor.name,
            request.tile_format.as_str(),
        );
        let started = Instant::now();

        match claim_region(
            &*self.ledger,
            &request.job_id,
            &request.region_id,
            &self.config.worker_id,
            self.config.queues.visibility_timeout,
        )
        .await?
        {
            ClaimOutcome::Claimed { attempts } => {
                debug!(
                    job_id = %request.job_id,
                    region_id = %request.region_id,
                    attempts,
                    "Claimed region"
                );
            }
            ClaimOutcome::AlreadySettled(status) => {
                debug!(
                    job_id = %request.job_id,
                    region_id = %request.region_id,
                    status = %status,
                    "Region already settled, skipping"
                );
                return self.settled_disposition(request).await;
            }
            ClaimOutcome::HeldByLiveWorker => {
                debug!(
                    job_id = %request.job_id,
                    region_id = %request.region_id,
                    "Region held by a live worker, skipping"
                );
                return Ok(RegionDisposition::held());
            }
        }
        self.metrics.invocation(dimensions.clone());

        // Open the image; only transient I/O escapes for redelivery.
        let info = match self.imagery.open(&request.image_url).await {
            Ok(info) => info,
            Err(err) if err.is_transient() => return Err(err.into()),
            Err(err) => {
                warn!(
                    job_id = %request.job_id,
                    region_id = %request.region_id,
                    error = %err,
                    "Cannot open image, settling region as ERROR"
                );
                self.metrics.error(dimensions);
                let completion = complete_region(
                    &*self.ledger,
                    &request.job_id,
                    &request.region_id,
                    false,
                    TileCounts::default(),
                    0,
                )
                .await?;
                return Ok(RegionDisposition {
                    run_finalization: completion.job_terminal,
                    job: Some(completion.job),
                    skipped: false,
                });
            }
        };

        let sensor_model =
            crate::sensor::build_sensor_model(info.metadata.geo_transform, info.width, info.height);
        let lifter = Arc::new(FeatureLifter::new(
            request.job_id.clone(),
            sensor_model,
            info.source_metadata(),
        ));

        // Enumerate tiles. Parameters were validated at the image stage, so
        // a failure here is a malformed region message: settle as ERROR.
        let tiles = match request.tile_params() {
            Ok(params) => {
                let generation_started = Instant::now();
                let grid = TileGrid::new(request.region_bounds, params);
                let tile_dimensions = MetricDimensions::new(
                    Operation::TileGeneration,
                    &request.image_processor.name,
                    request.tile_format.as_str(),
                );
                self.metrics.invocation(tile_dimensions.clone());
                let tiles: Vec<PixelRect> = grid.collect();
                self.metrics
                    .duration(tile_dimensions, generation_started.elapsed());
                tiles
            }
            Err(err) => {
                warn!(
                    job_id = %request.job_id,
                    region_id = %request.region_id,
                    error = %err,
                    "Invalid tile parameters, settling region as ERROR"
                );
                self.metrics.error(dimensions);
                let completion = complete_region(
                    &*self.ledger,
                    &request.job_id,
                    &request.region_id,
                    false,
                    TileCounts::default(),
                    0,
                )
                .await?;
                return Ok(RegionDisposition {
                    run_finalization: completion.job_terminal,
                    job: Some(completion.job),
                    skipped: false,
                });
            }
        };

        // Dispatch tiles from the bounded pool and buffer lifted features.
        let (features, counts, lift_errors) = self.dispatch_tiles(request, tiles, lifter).await;
        if lift_errors > 0 {
            warn!(
                job_id = %request.job_id,
                region_id = %request.region_id,
                lift_errors,
                "Some features retained with null geometry"
            );
        }

        // Aggregate: resolve boundary duplicates.
        let mode = self.config.distillation_mode(request.feature_distillation);
        let selector = FeatureSelector::new(DistillationOptions::with_mode(mode));
        let selected = selector.select(features);

        // Persist: durable feature output, then stream sinks in completion
        // order. Both are idempotent per region id.
        self.feature_store
            .put_region_features(&request.job_id, &request.region_id, selected.clone())
            .await?;
        self.sinks
            .stream_region_features(
                &request.outputs,
                &request.job_id,
                &request.region_id,
                &selected,
            )
            .await?;

        let failure_rate = if counts.total == 0 {
            0.0
        } else {
            counts.failed as f64 / counts.total as f64
        };
        let success = failure_rate <= self.config.processing.tile_error_rate_threshold;
        if !success {
            self.metrics.error(dimensions.clone());
        }

        let completion = complete_region(
            &*self.ledger,
            &request.job_id,
            &request.region_id,
            success,
            counts,
            selected.len() as u64,
        )
        .await?;
        self.metrics.duration(dimensions, started.elapsed());

        let region_status = if success {
            RegionStatus::Done
        } else {
            RegionStatus::Error
        };
        info!(
            job_id = %request.job_id,
            region_id = %request.region_id,
            status = %region_status,
            tiles = counts.total,
            failed_tiles = counts.failed,
            features = selected.len(),
            "Region processing complete"
        );

        Ok(RegionDisposition {
            run_finalization: completion.job_terminal,
            job: Some(completion.job),
            skipped: false,
        })
    }

    /// Fans tiles out to the endpoint under the per-region pool bound.
    async fn dispatch_tiles(
        &self,
        request: &RegionRequest,
        tiles: Vec<PixelRect>,
        lifter: Arc<FeatureLifter>,
    ) -> (Vec<Feature>, TileCounts, usize) {
        let mut counts = TileCounts {
            total: tiles.len() as u64,
            ..TileCounts::default()
        };
        if tiles.is_empty() {
            return (Vec::new(), counts, 0);
        }

        let client = Arc::new(ModelClient::new(
            Arc::clone(&self.transport),
            self.config.endpoint.retry,
            request.image_processor.name.clone(),
            request.tile_format.as_str(),
            self.metrics.clone(),
        ));
        let pool = Arc::new(Semaphore::new(self.config.processing.tile_pool_size));
        let mut dispatches: JoinSet<Result<TileOutcome, String>> = JoinSet::new();

        for tile in tiles {
            let pool = Arc::clone(&pool);
            let imagery = Arc::clone(&self.imagery);
            let client = Arc::clone(&client);
            let lifter = Arc::clone(&lifter);
            let metrics = self.metrics.clone();
            let request = request.clone();

            dispatches.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|_| "tile pool closed".to_string())?;
                dispatch_tile(&request, tile, imagery, client, lifter, metrics).await
            });
        }

        let mut features = Vec::new();
        let mut lift_errors = 0;
        while let Some(result) = dispatches.join_next().await {
            match result {
                Ok(Ok(outcome)) => {
                    counts.succeeded += 1;
                    lift_errors += outcome.lift_errors;
                    features.extend(outcome.features);
                }
                Ok(Err(message)) => {
                    counts.failed += 1;
                    warn!(
                        job_id = %request.job_id,
                        region_id = %request.region_id,
                        error = %message,
                        "Tile dropped"
                    );
                }
                Err(join_error) => {
                    counts.failed += 1;
                    warn!(error = %join_error, "Tile task panicked");
                }
            }
        }

        debug!(
            job_id = %request.job_id,
            region_id = %request.region_id,
            succeeded = counts.succeeded,
            failed = counts.failed,
            "Tile dispatch complete"
        );
        (features, counts, lift_errors)
    }

    /// Disposition for a duplicate delivery of a settled region.
    ///
    /// Catches the case where a worker died after writing the terminal job
    /// status but before finalization delivered the output document.
    async fn settled_disposition(
        &self,
        request: &RegionRequest,
    ) -> Result<RegionDisposition, RegionError> {
        let Some(stored) = self.ledger.get_job(&request.job_id).await? else {
            return Ok(RegionDisposition::held());
        };
        let job = stored.record;
        let wants_document = request
            .outputs
            .iter()
            .any(|output| matches!(output, crate::api::OutputSink::S3 { .. }));
        let run_finalization =
            job.status.is_terminal() && wants_document && job.output_locations.is_empty();
        Ok(RegionDisposition {
            job: Some(job),
            run_finalization,
            skipped: true,
        })
    }
}

/// Reads, encodes, invokes, and lifts one tile.
async fn dispatch_tile<I, T>(
    request: &RegionRequest,
    tile: PixelRect,
    imagery: Arc<I>,
    client: Arc<ModelClient<T>>,
    lifter: Arc<FeatureLifter>,
    metrics: MetricsClient,
) -> Result<TileOutcome, String>
where
    I: ImageReader,
    T: EndpointTransport,
{
    let dimensions = MetricDimensions::new(
        Operation::TileProcessing,
        &request.image_processor.name,
        request.tile_format.as_str(),
    );
    metrics.invocation(dimensions.clone());
    let started = Instant::now();

    let pixels = imagery
        .read_window(&request.image_url, tile)
        .await
        .map_err(|err| {
            metrics.error(dimensions.clone());
            format!("read failed: {err}")
        })?;

    // Encoding is CPU work; keep it off the async workers.
    let format = request.tile_format;
    let compression = request.tile_compression;
    let payload = tokio::task::spawn_blocking(move || encode_tile(&pixels, format, compression))
        .await
        .map_err(|err| {
            metrics.error(dimensions.clone());
            format!("encode task failed: {err}")
        })?
        .map_err(|err| {
            metrics.error(dimensions.clone());
            format!("encode failed: {err}")
        })?;

    let detections = client
        .detect_features(Bytes::from(payload), format.content_type())
        .await
        .map_err(|err| {
            metrics.error(dimensions.clone());
            format!("inference failed: {err}")
        })?;

    let outcome = lifter.lift_tile_features(detections, &tile);
    metrics.duration(dimensions, started.elapsed());
    Ok(TileOutcome {
        features: outcome.features,
        lift_errors: outcome.lift_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ImageRequest;
    use crate::endpoint::ScriptedTransport;
    use crate::imagery::{ImageMetadata, SyntheticImageReader};
    use crate::ledger::{record_region_plan, start_job, InMemoryFeatureStore, InMemoryLedger};
    use crate::ledger::{JobRecord, JobStatus};
    use crate::sink::{InMemoryObjectStore, InMemoryRecordStream};

    const EMPTY_COLLECTION: &str = r#"{"type":"FeatureCollection","features":[]}"#;

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        feature_store: Arc<InMemoryFeatureStore>,
        imagery: Arc<SyntheticImageReader>,
        processor: RegionProcessor<
            InMemoryLedger,
            InMemoryFeatureStore,
            SyntheticImageReader,
            ScriptedTransport,
            InMemoryObjectStore,
            InMemoryRecordStream,
        >,
    }

    fn fixture(transport: ScriptedTransport) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let feature_store = Arc::new(InMemoryFeatureStore::new());
        let imagery = Arc::new(SyntheticImageReader::new());
        let sinks = Arc::new(SinkWriter::new(
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryRecordStream::new()),
        ));
        let mut config = ServiceConfig::default();
        config.endpoint.retry.jitter = 0.0;
        let processor = RegionProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&feature_store),
            Arc::clone(&imagery),
            Arc::new(transport),
            sinks,
            MetricsClient::disconnected(),
            config.into_shared(),
        );
        Fixture {
            ledger,
            feature_store,
            imagery,
            processor,
        }
    }

    fn image_request(job_id: &str) -> ImageRequest {
        serde_json::from_str(&format!(
            r#"{{
                "jobId": "{job_id}",
                "imageUrls": ["s3://imagery/a.tif"],
                "imageProcessor": {{"name": "detector", "type": "HTTP_ENDPOINT"}},
                "imageProcessorTileSize": 512,
                "imageProcessorTileOverlap": 0,
                "imageProcessorTileFormat": "PNG"
            }}"#
        ))
        .unwrap()
    }

    async fn seed_job(fixture: &Fixture, job_id: &str, region_count: u32) {
        start_job(&*fixture.ledger, JobRecord::new(image_request(job_id)))
            .await
            .unwrap();
        record_region_plan(&*fixture.ledger, job_id, region_count, 1000, 800)
            .await
            .unwrap();
    }

    fn region_request(job_id: &str, bounds: PixelRect) -> RegionRequest {
        RegionRequest::from_image_request(&image_request(job_id), "s3://imagery/a.tif", bounds)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_region_success_settles_job() {
        let body = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":null,
             "properties":{"bounds_imcoords":[1.0,1.0,9.0,9.0],
                           "feature_types":{"ship":0.9}}}
        ]}"#;
        let fixture = fixture(ScriptedTransport::always_ok(body));
        fixture
            .imagery
            .add_image("s3://imagery/a.tif", 1000, 800, ImageMetadata::default());
        seed_job(&fixture, "j1", 1).await;

        let request = region_request("j1", PixelRect::new(0, 0, 1000, 800));
        let disposition = fixture.processor.process(&request).await.unwrap();

        assert!(!disposition.skipped);
        assert!(disposition.run_finalization);
        let job = disposition.job.unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.region_success, 1);

        // 1000x800 at 512/0 overlap -> 2x2 tiles, one feature each
        let features = fixture.feature_store.job_features("j1").await.unwrap();
        assert_eq!(features.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_tiles_failing_marks_region_error() {
        let fixture = fixture(ScriptedTransport::new(vec![Ok(
            crate::endpoint::TransportResponse {
                status: 500,
                body: bytes::Bytes::new(),
            },
        )]));
        fixture
            .imagery
            .add_image("s3://imagery/a.tif", 600, 600, ImageMetadata::default());
        seed_job(&fixture, "j1", 1).await;

        let request = region_request("j1", PixelRect::new(0, 0, 600, 600));
        let disposition = fixture.processor.process(&request).await.unwrap();

        let job = disposition.job.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.region_error, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_image_settles_region_error() {
        let fixture = fixture(ScriptedTransport::always_ok(EMPTY_COLLECTION));
        seed_job(&fixture, "j1", 1).await;

        // Image never registered: permanent NotFound
        let request = region_request("j1", PixelRect::new(0, 0, 100, 100));
        let disposition = fixture.processor.process(&request).await.unwrap();

        let job = disposition.job.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_delivery_skips() {
        let fixture = fixture(ScriptedTransport::always_ok(EMPTY_COLLECTION));
        fixture
            .imagery
            .add_image("s3://imagery/a.tif", 100, 100, ImageMetadata::default());
        seed_job(&fixture, "j1", 1).await;

        let request = region_request("j1", PixelRect::new(0, 0, 100, 100));
        let first = fixture.processor.process(&request).await.unwrap();
        assert!(!first.skipped);

        let second = fixture.processor.process(&request).await.unwrap();
        assert!(second.skipped);
        // Counters unchanged by the duplicate
        let job = second.job.unwrap();
        assert_eq!(job.region_success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_feature_region_completes() {
        let fixture = fixture(ScriptedTransport::always_ok(EMPTY_COLLECTION));
        fixture
            .imagery
            .add_image("s3://imagery/a.tif", 256, 256, ImageMetadata::default());
        seed_job(&fixture, "j1", 1).await;

        let request = region_request("j1", PixelRect::new(0, 0, 256, 256));
        let disposition = fixture.processor.process(&request).await.unwrap();
        let job = disposition.job.unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert!(fixture
            .feature_store
            .job_features("j1")
            .await
            .unwrap()
            .is_empty());
    }
}
