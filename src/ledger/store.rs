//! The conditional-write key-value contract and its in-memory
//! implementation.
//!
//! The production ledger is an external store with server-side conditional
//! updates (optimistic concurrency). This crate expresses that contract as
//! versioned compare-and-swap: readers get a record with its version, writers
//! put back against the version they read, and a conflict means someone else
//! won the race and the caller re-reads. [`InMemoryLedger`] provides the
//! same semantics in-process for tests and single-node deployments.

use super::job::JobRecord;
use super::region::RegionRecord;
use crate::feature::Feature;
use dashmap::DashMap;
use std::future::Future;
use thiserror::Error;

/// Errors from ledger operations.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The record a conditional update targets does not exist.
    #[error("ledger record not found: {0}")]
    NotFound(String),

    /// Store or network failure. Transient: surfaced to the queue
    /// coordinator for redelivery.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// A record together with the version its read observed.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

/// Conditional-write key-value store for job and region records.
///
/// `create_*` is put-if-absent; `put_*` succeeds only when the stored
/// version still matches `expected_version`. Both return `false` on a lost
/// race rather than erroring, since races are the normal mechanism of
/// coordination here.
pub trait Ledger: Send + Sync + 'static {
    fn create_job(
        &self,
        record: JobRecord,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    fn get_job(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<Versioned<JobRecord>>, LedgerError>> + Send;

    fn put_job(
        &self,
        expected_version: u64,
        record: JobRecord,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    fn create_region(
        &self,
        record: RegionRecord,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    fn get_region(
        &self,
        job_id: &str,
        region_id: &str,
    ) -> impl Future<Output = Result<Option<Versioned<RegionRecord>>, LedgerError>> + Send;

    fn put_region(
        &self,
        expected_version: u64,
        record: RegionRecord,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;
}

/// Durable store for per-region feature output, keyed by
/// `(job_id, region_id)`.
///
/// Writes are idempotent overwrites so a reclaimed region that reprocesses
/// cannot duplicate features in the final aggregation.
pub trait FeatureStore: Send + Sync + 'static {
    fn put_region_features(
        &self,
        job_id: &str,
        region_id: &str,
        features: Vec<Feature>,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    fn job_features(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<Feature>, LedgerError>> + Send;
}

/// In-process ledger backed by concurrent maps with per-key versioning.
#[derive(Default)]
pub struct InMemoryLedger {
    jobs: DashMap<String, Versioned<JobRecord>>,
    regions: DashMap<(String, String), Versioned<RegionRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for InMemoryLedger {
    async fn create_job(&self, record: JobRecord) -> Result<bool, LedgerError> {
        let mut created = false;
        self.jobs
            .entry(record.job_id.clone())
            .or_insert_with(|| {
                created = true;
                Versioned { version: 1, record }
            });
        Ok(created)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Versioned<JobRecord>>, LedgerError> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    async fn put_job(&self, expected_version: u64, record: JobRecord) -> Result<bool, LedgerError> {
        match self.jobs.get_mut(&record.job_id) {
            Some(mut entry) if entry.version == expected_version => {
                *entry = Versioned {
                    version: expected_version + 1,
                    record,
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_region(&self, record: RegionRecord) -> Result<bool, LedgerError> {
        let key = (record.job_id.clone(), record.region_id.clone());
        let mut created = false;
        self.regions.entry(key).or_insert_with(|| {
            created = true;
            Versioned { version: 1, record }
        });
        Ok(created)
    }

    async fn get_region(
        &self,
        job_id: &str,
        region_id: &str,
    ) -> Result<Option<Versioned<RegionRecord>>, LedgerError> {
        Ok(self
            .regions
            .get(&(job_id.to_string(), region_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn put_region(
        &self,
        expected_version: u64,
        record: RegionRecord,
    ) -> Result<bool, LedgerError> {
        let key = (record.job_id.clone(), record.region_id.clone());
        match self.regions.get_mut(&key) {
            Some(mut entry) if entry.version == expected_version => {
                *entry = Versioned {
                    version: expected_version + 1,
                    record,
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-process feature store.
#[derive(Default)]
pub struct InMemoryFeatureStore {
    features: DashMap<(String, String), Vec<Feature>>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureStore for InMemoryFeatureStore {
    async fn put_region_features(
        &self,
        job_id: &str,
        region_id: &str,
        features: Vec<Feature>,
    ) -> Result<(), LedgerError> {
        self.features
            .insert((job_id.to_string(), region_id.to_string()), features);
        Ok(())
    }

    async fn job_features(&self, job_id: &str) -> Result<Vec<Feature>, LedgerError> {
        // Deterministic aggregation order: sort contributing regions by id
        let mut regions: Vec<(String, Vec<Feature>)> = self
            .features
            .iter()
            .filter(|entry| entry.key().0 == job_id)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        regions.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(regions.into_iter().flat_map(|(_, features)| features).collect())
    }
}
