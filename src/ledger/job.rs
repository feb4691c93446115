//! Job records and status transitions.

use crate::api::ImageRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an image job.
///
/// Transitions form a DAG with no regressions:
/// `New -> InProgress -> {Success, Partial, Failed}`. The terminal status is
/// written at most once, by the worker whose region completion settles the
/// last outstanding region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    InProgress,
    /// Every region succeeded.
    Success,
    /// Some regions succeeded, some failed.
    Partial,
    /// No region succeeded, or the job failed before regions ran.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Partial | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::New => "NEW",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Partial => "PARTIAL",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// The durable per-image job record.
///
/// Invariant: `region_success + region_error <= region_count` at every
/// snapshot, with equality exactly when the status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub image_url: String,
    pub model_name: String,

    /// Total regions planned; zero until planning completes.
    pub region_count: u32,
    pub region_success: u32,
    pub region_error: u32,

    /// Full-image dimensions, recorded at planning time.
    pub width: u32,
    pub height: u32,

    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// The request this job was created from, echoed for observability.
    pub request: ImageRequest,

    /// Where finalization wrote the job output (object keys, stream names).
    #[serde(default)]
    pub output_locations: Vec<String>,
}

impl JobRecord {
    /// A fresh record for a just-dequeued request.
    pub fn new(request: ImageRequest) -> Self {
        let image_url = request.primary_image_url().unwrap_or_default().to_string();
        let model_name = request.image_processor.name.clone();
        Self {
            job_id: request.job_id.clone(),
            status: JobStatus::New,
            image_url,
            model_name,
            region_count: 0,
            region_success: 0,
            region_error: 0,
            width: 0,
            height: 0,
            start_time: Utc::now(),
            end_time: None,
            request,
            output_locations: Vec::new(),
        }
    }

    /// Whether every planned region has settled.
    pub fn all_regions_settled(&self) -> bool {
        self.region_count > 0 && self.region_success + self.region_error == self.region_count
    }

    /// The terminal status implied by the current counters.
    pub fn terminal_status(&self) -> JobStatus {
        if self.region_error == 0 {
            JobStatus::Success
        } else if self.region_success == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        }
    }
}
