//! Region records: the per-region claim and completion state.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle of one region of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionStatus {
    /// A worker holds the region; the claim expires with the queue
    /// visibility timeout unless heartbeats extend it.
    Claimed,
    Done,
    Error,
}

impl RegionStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, RegionStatus::Done | RegionStatus::Error)
    }
}

impl std::fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegionStatus::Claimed => "CLAIMED",
            RegionStatus::Done => "DONE",
            RegionStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The durable per-region record, keyed by `(job_id, region_id)`.
///
/// Created by conditional put when a worker claims the region, which is what
/// prevents two workers from processing the same region concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub job_id: String,
    pub region_id: String,
    pub status: RegionStatus,
    pub worker_id: String,
    /// Claim attempts, across reclaims after expiry.
    pub attempts: u32,
    /// When the current claim lapses and another worker may reclaim.
    pub claim_expires: DateTime<Utc>,

    pub total_tiles: u64,
    pub succeeded_tiles: u64,
    pub failed_tiles: u64,
    /// Features this region contributed after distillation.
    pub feature_count: u64,
}

impl RegionRecord {
    /// A fresh claim for a region by `worker_id`.
    pub fn claimed(
        job_id: impl Into<String>,
        region_id: impl Into<String>,
        worker_id: impl Into<String>,
        visibility: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            region_id: region_id.into(),
            status: RegionStatus::Claimed,
            worker_id: worker_id.into(),
            attempts: 1,
            claim_expires: claim_deadline(visibility),
            total_tiles: 0,
            succeeded_tiles: 0,
            failed_tiles: 0,
            feature_count: 0,
        }
    }

    /// Whether the claim has lapsed and the region may be reclaimed.
    pub fn claim_expired(&self) -> bool {
        self.status == RegionStatus::Claimed && self.claim_expires <= Utc::now()
    }
}

/// Deadline for a claim given the queue visibility timeout.
pub fn claim_deadline(visibility: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(visibility).unwrap_or(ChronoDuration::seconds(30))
}
