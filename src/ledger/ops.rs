//! Optimistic-concurrency operations over the ledger.
//!
//! Each operation is a get -> mutate -> compare-and-swap loop. A lost swap
//! means another worker moved the record; the loop re-reads and re-decides,
//! so every state transition is taken exactly once fleet-wide.

use super::job::{JobRecord, JobStatus};
use super::region::{claim_deadline, RegionRecord, RegionStatus};
use super::store::{Ledger, LedgerError};
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

/// Result of attempting to start an image job.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// This worker created the record and owns image-level processing.
    Started,
    /// Another worker is already processing the job; skip.
    AlreadyRunning,
    /// The job already finished; acknowledge the duplicate message.
    AlreadyTerminal(JobStatus),
}

/// Creates the job record and performs the single NEW -> IN_PROGRESS
/// transition.
pub async fn start_job<L: Ledger>(
    ledger: &L,
    record: JobRecord,
) -> Result<StartOutcome, LedgerError> {
    let job_id = record.job_id.clone();
    if ledger.create_job(record).await? {
        // We created it; move NEW -> IN_PROGRESS under CAS.
        loop {
            let stored = ledger
                .get_job(&job_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(job_id.clone()))?;
            if stored.record.status != JobStatus::New {
                // Someone else advanced it; treat as already running.
                return Ok(StartOutcome::AlreadyRunning);
            }
            let mut updated = stored.record;
            updated.status = JobStatus::InProgress;
            if ledger.put_job(stored.version, updated).await? {
                return Ok(StartOutcome::Started);
            }
        }
    }

    let existing = ledger
        .get_job(&job_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(job_id.clone()))?;
    if existing.record.status.is_terminal() {
        Ok(StartOutcome::AlreadyTerminal(existing.record.status))
    } else {
        Ok(StartOutcome::AlreadyRunning)
    }
}

/// Records the planned region count and image dimensions on the job.
pub async fn record_region_plan<L: Ledger>(
    ledger: &L,
    job_id: &str,
    region_count: u32,
    width: u32,
    height: u32,
) -> Result<(), LedgerError> {
    loop {
        let stored = ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;
        let mut updated = stored.record;
        updated.region_count = region_count;
        updated.width = width;
        updated.height = height;
        if ledger.put_job(stored.version, updated).await? {
            return Ok(());
        }
    }
}

/// Result of attempting to claim a region.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This worker holds the region.
    Claimed { attempts: u32 },
    /// The region already completed (DONE or ERROR); its outcome is already
    /// counted on the job. Acknowledge the duplicate message.
    AlreadySettled(RegionStatus),
    /// Another worker's claim is still live; let the message return later.
    HeldByLiveWorker,
}

/// Claims a region for `worker_id` via conditional put.
///
/// An expired claim (worker death, lost heartbeat) is reclaimable; the
/// attempt counter carries across reclaims.
pub async fn claim_region<L: Ledger>(
    ledger: &L,
    job_id: &str,
    region_id: &str,
    worker_id: &str,
    visibility: Duration,
) -> Result<ClaimOutcome, LedgerError> {
    loop {
        match ledger.get_region(job_id, region_id).await? {
            None => {
                let record = RegionRecord::claimed(job_id, region_id, worker_id, visibility);
                if ledger.create_region(record).await? {
                    return Ok(ClaimOutcome::Claimed { attempts: 1 });
                }
                // Lost the create race; re-read and re-decide.
            }
            Some(stored) => {
                if stored.record.status.is_settled() {
                    return Ok(ClaimOutcome::AlreadySettled(stored.record.status));
                }
                if !stored.record.claim_expired() {
                    return Ok(ClaimOutcome::HeldByLiveWorker);
                }
                let mut updated = stored.record;
                updated.worker_id = worker_id.to_string();
                updated.attempts += 1;
                updated.claim_expires = claim_deadline(visibility);
                let attempts = updated.attempts;
                if ledger.put_region(stored.version, updated).await? {
                    debug!(job_id, region_id, attempts, "Reclaimed expired region");
                    return Ok(ClaimOutcome::Claimed { attempts });
                }
            }
        }
    }
}

/// Tile accounting reported with a region completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileCounts {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Result of settling a region against its job.
#[derive(Debug, Clone)]
pub struct RegionCompletion {
    /// The job record after this completion's update (or the current record
    /// when the completion was a duplicate).
    pub job: JobRecord,
    /// True exactly when this call wrote the job's terminal status. The
    /// caller that sees `true` runs finalization.
    pub job_terminal: bool,
}

/// Marks a region DONE or ERROR and counts it on the job atomically.
///
/// The region transition is a CAS, so only one worker counts a given region
/// even under reclaim races; the loser returns with `job_terminal = false`
/// and no counter change. When the winning increment settles the last
/// region, the same update writes the terminal status and end time.
pub async fn complete_region<L: Ledger>(
    ledger: &L,
    job_id: &str,
    region_id: &str,
    success: bool,
    tiles: TileCounts,
    feature_count: u64,
) -> Result<RegionCompletion, LedgerError> {
    // Settle the region record first; the winner proceeds to the job.
    let won = loop {
        let stored = ledger
            .get_region(job_id, region_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("{job_id}/{region_id}")))?;
        if stored.record.status.is_settled() {
            break false;
        }
        let mut updated = stored.record;
        updated.status = if success {
            RegionStatus::Done
        } else {
            RegionStatus::Error
        };
        updated.total_tiles = tiles.total;
        updated.succeeded_tiles = tiles.succeeded;
        updated.failed_tiles = tiles.failed;
        updated.feature_count = feature_count;
        if ledger.put_region(stored.version, updated).await? {
            break true;
        }
    };

    if !won {
        let job = ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;
        return Ok(RegionCompletion {
            job: job.record,
            job_terminal: false,
        });
    }

    loop {
        let stored = ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;
        let mut job = stored.record;
        if success {
            job.region_success += 1;
        } else {
            job.region_error += 1;
        }

        let mut job_terminal = false;
        if job.all_regions_settled() && !job.status.is_terminal() {
            job.status = job.terminal_status();
            job.end_time = Some(Utc::now());
            job_terminal = true;
        }

        if ledger.put_job(stored.version, job.clone()).await? {
            return Ok(RegionCompletion { job, job_terminal });
        }
    }
}

/// Marks the job FAILED with an end time. No-op when already terminal.
pub async fn fail_job<L: Ledger>(ledger: &L, job_id: &str) -> Result<JobRecord, LedgerError> {
    loop {
        let stored = ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;
        if stored.record.status.is_terminal() {
            return Ok(stored.record);
        }
        let mut job = stored.record;
        job.status = JobStatus::Failed;
        job.end_time = Some(Utc::now());
        if ledger.put_job(stored.version, job.clone()).await? {
            return Ok(job);
        }
    }
}

/// Records where finalization delivered the job output.
pub async fn record_output_locations<L: Ledger>(
    ledger: &L,
    job_id: &str,
    locations: Vec<String>,
) -> Result<(), LedgerError> {
    loop {
        let stored = ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;
        let mut job = stored.record;
        job.output_locations = locations.clone();
        if ledger.put_job(stored.version, job).await? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ImageRequest;
    use crate::ledger::store::InMemoryLedger;

    fn record(job_id: &str) -> JobRecord {
        let request: ImageRequest = serde_json::from_str(&format!(
            r#"{{
                "jobId": "{job_id}",
                "imageUrls": ["s3://b/i.tif"],
                "imageProcessor": {{"name": "m", "type": "HTTP_ENDPOINT"}}
            }}"#
        ))
        .unwrap();
        JobRecord::new(request)
    }

    const VIS: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_start_job_once() {
        let ledger = InMemoryLedger::new();
        assert_eq!(
            start_job(&ledger, record("j1")).await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            start_job(&ledger, record("j1")).await.unwrap(),
            StartOutcome::AlreadyRunning
        );

        let stored = ledger.get_job("j1").await.unwrap().unwrap();
        assert_eq!(stored.record.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_start_job_after_terminal_reports_status() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        fail_job(&ledger, "j1").await.unwrap();

        assert_eq!(
            start_job(&ledger, record("j1")).await.unwrap(),
            StartOutcome::AlreadyTerminal(JobStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_claim_and_duplicate_claim() {
        let ledger = InMemoryLedger::new();
        assert_eq!(
            claim_region(&ledger, "j1", "r1", "w1", VIS).await.unwrap(),
            ClaimOutcome::Claimed { attempts: 1 }
        );
        // A second live claim is refused
        assert_eq!(
            claim_region(&ledger, "j1", "r1", "w2", VIS).await.unwrap(),
            ClaimOutcome::HeldByLiveWorker
        );
    }

    #[tokio::test]
    async fn test_expired_claim_is_reclaimable() {
        let ledger = InMemoryLedger::new();
        claim_region(&ledger, "j1", "r1", "w1", Duration::ZERO)
            .await
            .unwrap();

        match claim_region(&ledger, "j1", "r1", "w2", VIS).await.unwrap() {
            ClaimOutcome::Claimed { attempts } => assert_eq!(attempts, 2),
            other => panic!("expected reclaim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_region_counts_once() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        record_region_plan(&ledger, "j1", 2, 100, 100).await.unwrap();
        claim_region(&ledger, "j1", "r1", "w1", VIS).await.unwrap();

        let first = complete_region(&ledger, "j1", "r1", true, TileCounts::default(), 0)
            .await
            .unwrap();
        assert_eq!(first.job.region_success, 1);
        assert!(!first.job_terminal);

        // Duplicate completion does not double-count
        let duplicate = complete_region(&ledger, "j1", "r1", true, TileCounts::default(), 0)
            .await
            .unwrap();
        assert_eq!(duplicate.job.region_success, 1);
        assert!(!duplicate.job_terminal);
    }

    #[tokio::test]
    async fn test_last_region_writes_terminal_once() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        record_region_plan(&ledger, "j1", 2, 100, 100).await.unwrap();
        claim_region(&ledger, "j1", "r1", "w1", VIS).await.unwrap();
        claim_region(&ledger, "j1", "r2", "w2", VIS).await.unwrap();

        let first = complete_region(&ledger, "j1", "r1", true, TileCounts::default(), 0)
            .await
            .unwrap();
        assert!(!first.job_terminal);

        let last = complete_region(&ledger, "j1", "r2", true, TileCounts::default(), 0)
            .await
            .unwrap();
        assert!(last.job_terminal);
        assert_eq!(last.job.status, JobStatus::Success);
        assert!(last.job.end_time.is_some());
    }

    #[tokio::test]
    async fn test_mixed_outcomes_partial() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        record_region_plan(&ledger, "j1", 2, 100, 100).await.unwrap();
        claim_region(&ledger, "j1", "r1", "w1", VIS).await.unwrap();
        claim_region(&ledger, "j1", "r2", "w1", VIS).await.unwrap();

        complete_region(&ledger, "j1", "r1", true, TileCounts::default(), 0)
            .await
            .unwrap();
        let last = complete_region(&ledger, "j1", "r2", false, TileCounts::default(), 0)
            .await
            .unwrap();
        assert!(last.job_terminal);
        assert_eq!(last.job.status, JobStatus::Partial);
    }

    #[tokio::test]
    async fn test_all_errors_failed() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        record_region_plan(&ledger, "j1", 1, 100, 100).await.unwrap();
        claim_region(&ledger, "j1", "r1", "w1", VIS).await.unwrap();

        let last = complete_region(&ledger, "j1", "r1", false, TileCounts::default(), 0)
            .await
            .unwrap();
        assert!(last.job_terminal);
        assert_eq!(last.job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_counter_invariant_holds() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        record_region_plan(&ledger, "j1", 3, 100, 100).await.unwrap();

        for region in ["r1", "r2", "r3"] {
            claim_region(&ledger, "j1", region, "w1", VIS).await.unwrap();
            complete_region(&ledger, "j1", region, true, TileCounts::default(), 0)
                .await
                .unwrap();
            let job = ledger.get_job("j1").await.unwrap().unwrap().record;
            assert!(job.region_success + job.region_error <= job.region_count);
            assert_eq!(
                job.all_regions_settled(),
                job.status.is_terminal(),
                "equality with region_count implies terminal"
            );
        }
    }

    #[tokio::test]
    async fn test_settled_region_claim_skips() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        record_region_plan(&ledger, "j1", 1, 100, 100).await.unwrap();
        claim_region(&ledger, "j1", "r1", "w1", VIS).await.unwrap();
        complete_region(&ledger, "j1", "r1", true, TileCounts::default(), 0)
            .await
            .unwrap();

        assert_eq!(
            claim_region(&ledger, "j1", "r1", "w2", VIS).await.unwrap(),
            ClaimOutcome::AlreadySettled(RegionStatus::Done)
        );
    }

    #[tokio::test]
    async fn test_fail_job_is_idempotent() {
        let ledger = InMemoryLedger::new();
        start_job(&ledger, record("j1")).await.unwrap();
        record_region_plan(&ledger, "j1", 1, 100, 100).await.unwrap();
        claim_region(&ledger, "j1", "r1", "w1", VIS).await.unwrap();
        let completion = complete_region(&ledger, "j1", "r1", true, TileCounts::default(), 0)
            .await
            .unwrap();
        assert_eq!(completion.job.status, JobStatus::Success);

        // A late failure cannot regress a terminal status
        let after = fail_job(&ledger, "j1").await.unwrap();
        assert_eq!(after.status, JobStatus::Success);
    }
}
