//! Output delivery.
//!
//! Two sink families exist behind narrow collaborator traits: an object
//! store receiving one GeoJSON FeatureCollection document per job at
//! finalization, and a streaming bus receiving batches of individual
//! features as regions complete. Stream writes are keyed by
//! `job_id:region_id` so downstream consumers can detect duplicates from
//! reclaimed regions.

use crate::api::OutputSink;
use crate::feature::{Feature, FeatureCollection};
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Features per stream batch unless the output descriptor overrides it.
pub const DEFAULT_STREAM_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// Transient delivery failure; surfaced for redelivery.
    #[error("sink write failed: {0}")]
    WriteFailed(String),

    #[error("failed to serialize features: {0}")]
    Serialize(String),
}

/// Object store collaborator (S3-shaped).
pub trait ObjectStore: Send + Sync + 'static {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Streaming bus collaborator (Kinesis-shaped).
pub trait RecordStream: Send + Sync + 'static {
    fn put_records(
        &self,
        stream: &str,
        partition_key: &str,
        records: Vec<Vec<u8>>,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Routes job output to the sinks a request named.
pub struct SinkWriter<O, K> {
    object_store: Arc<O>,
    record_stream: Arc<K>,
    default_batch_size: usize,
}

impl<O: ObjectStore, K: RecordStream> SinkWriter<O, K> {
    pub fn new(object_store: Arc<O>, record_stream: Arc<K>) -> Self {
        Self {
            object_store,
            record_stream,
            default_batch_size: DEFAULT_STREAM_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.default_batch_size = batch_size.max(1);
        self
    }

    /// Streams one region's features to every bus sink in `outputs`.
    ///
    /// Called as each region completes; ordering across regions follows
    /// completion order, never spatial order.
    pub async fn stream_region_features(
        &self,
        outputs: &[OutputSink],
        job_id: &str,
        region_id: &str,
        features: &[Feature],
    ) -> Result<(), SinkError> {
        if features.is_empty() {
            return Ok(());
        }
        let partition_key = format!("{job_id}:{region_id}");
        for output in outputs {
            let OutputSink::Kinesis { stream, batch_size } = output else {
                continue;
            };
            let batch_size = batch_size.unwrap_or(self.default_batch_size).max(1);
            for chunk in features.chunks(batch_size) {
                let records = chunk
                    .iter()
                    .map(|feature| {
                        serde_json::to_vec(feature)
                            .map_err(|err| SinkError::Serialize(err.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.record_stream
                    .put_records(stream, &partition_key, records)
                    .await?;
            }
            debug!(
                job_id,
                region_id,
                stream,
                count = features.len(),
                "Streamed region features"
            );
        }
        Ok(())
    }

    /// Writes the per-job GeoJSON document to every object-store sink.
    ///
    /// Returns the locations written, recorded on the job for
    /// observability.
    pub async fn write_job_document(
        &self,
        outputs: &[OutputSink],
        job_id: &str,
        features: &[Feature],
    ) -> Result<Vec<String>, SinkError> {
        let mut locations = Vec::new();
        let mut document: Option<Vec<u8>> = None;
        for output in outputs {
            let OutputSink::S3 { bucket, prefix } = output else {
                continue;
            };
            let body = match &document {
                Some(body) => body.clone(),
                None => {
                    let collection = FeatureCollection::new(features.to_vec());
                    let body = serde_json::to_vec(&collection)
                        .map_err(|err| SinkError::Serialize(err.to_string()))?;
                    document = Some(body.clone());
                    body
                }
            };
            let key = object_key(prefix, job_id);
            self.object_store.put_object(bucket, &key, body).await?;
            debug!(job_id, bucket, key, "Wrote job feature document");
            locations.push(format!("s3://{bucket}/{key}"));
        }
        if locations.is_empty() && outputs.iter().any(|o| matches!(o, OutputSink::S3 { .. })) {
            warn!(job_id, "No object sink accepted the job document");
        }
        Ok(locations)
    }
}

fn object_key(prefix: &str, job_id: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        format!("{job_id}.geojson")
    } else {
        format!("{trimmed}/{job_id}.geojson")
    }
}

/// In-memory object store for tests and local runs.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<(String, String)> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl ObjectStore for InMemoryObjectStore {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), SinkError> {
        self.objects
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }
}

/// In-memory record stream for tests and local runs.
#[derive(Default)]
pub struct InMemoryRecordStream {
    batches: Mutex<Vec<(String, String, Vec<Vec<u8>>)>>,
}

impl InMemoryRecordStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches written so far, as `(stream, partition_key, records)`.
    pub fn batches(&self) -> Vec<(String, String, Vec<Vec<u8>>)> {
        self.batches.lock().expect("batch log poisoned").clone()
    }

    /// Total records across all batches for one stream.
    pub fn record_count(&self, stream: &str) -> usize {
        self.batches()
            .iter()
            .filter(|(name, _, _)| name == stream)
            .map(|(_, _, records)| records.len())
            .sum()
    }
}

impl RecordStream for InMemoryRecordStream {
    async fn put_records(
        &self,
        stream: &str,
        partition_key: &str,
        records: Vec<Vec<u8>>,
    ) -> Result<(), SinkError> {
        self.batches.lock().expect("batch log poisoned").push((
            stream.to_string(),
            partition_key.to_string(),
            records,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> (
        Arc<InMemoryObjectStore>,
        Arc<InMemoryRecordStream>,
        SinkWriter<InMemoryObjectStore, InMemoryRecordStream>,
    ) {
        let store = Arc::new(InMemoryObjectStore::new());
        let stream = Arc::new(InMemoryRecordStream::new());
        let writer = SinkWriter::new(Arc::clone(&store), Arc::clone(&stream));
        (store, stream, writer)
    }

    fn features(n: usize) -> Vec<Feature> {
        (0..n).map(|_| Feature::new()).collect()
    }

    #[test]
    fn test_object_key_layout() {
        assert_eq!(object_key("", "j1"), "j1.geojson");
        assert_eq!(object_key("out", "j1"), "out/j1.geojson");
        assert_eq!(object_key("out/", "j1"), "out/j1.geojson");
    }

    #[tokio::test]
    async fn test_job_document_written_per_object_sink() {
        let (store, _, writer) = writer();
        let outputs = vec![OutputSink::S3 {
            bucket: "results".to_string(),
            prefix: "jobs/".to_string(),
        }];

        let locations = writer
            .write_job_document(&outputs, "job-1", &features(2))
            .await
            .unwrap();
        assert_eq!(locations, vec!["s3://results/jobs/job-1.geojson"]);

        let body = store.get("results", "jobs/job-1.geojson").unwrap();
        let collection: FeatureCollection = serde_json::from_slice(&body).unwrap();
        assert_eq!(collection.features.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_batching() {
        let (_, stream, writer) = writer();
        let writer = writer.with_batch_size(2);
        let outputs = vec![OutputSink::Kinesis {
            stream: "detections".to_string(),
            batch_size: None,
        }];

        writer
            .stream_region_features(&outputs, "job-1", "r-0", &features(5))
            .await
            .unwrap();

        let batches = stream.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].1, "job-1:r-0");
        assert_eq!(batches[0].2.len(), 2);
        assert_eq!(batches[2].2.len(), 1);
        assert_eq!(stream.record_count("detections"), 5);
    }

    #[tokio::test]
    async fn test_per_output_batch_override() {
        let (_, stream, writer) = writer();
        let outputs = vec![OutputSink::Kinesis {
            stream: "detections".to_string(),
            batch_size: Some(1),
        }];

        writer
            .stream_region_features(&outputs, "job-1", "r-0", &features(3))
            .await
            .unwrap();
        assert_eq!(stream.batches().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_features_skip_stream() {
        let (_, stream, writer) = writer();
        let outputs = vec![OutputSink::Kinesis {
            stream: "detections".to_string(),
            batch_size: None,
        }];
        writer
            .stream_region_features(&outputs, "job-1", "r-0", &[])
            .await
            .unwrap();
        assert!(stream.batches().is_empty());
    }

    #[tokio::test]
    async fn test_object_sinks_ignore_stream_writes() {
        let (store, _, writer) = writer();
        let outputs = vec![OutputSink::S3 {
            bucket: "results".to_string(),
            prefix: String::new(),
        }];
        writer
            .stream_region_features(&outputs, "job-1", "r-0", &features(2))
            .await
            .unwrap();
        assert!(store.keys().is_empty());
    }
}
