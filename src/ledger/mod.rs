//! The job ledger: durable, conditionally-updated coordination state.
//!
//! The ledger is the only shared mutable state in the system. It is a
//! key-value store with server-side conditional writes, used to enforce:
//!
//! - exactly one NEW -> IN_PROGRESS transition per image job
//! - exactly one worker processing a region at a time (conditional claim
//!   with a visibility-timeout lease)
//! - atomic region success/error counting on the job
//! - exactly one terminal transition per job, which is what triggers
//!   finalization
//!
//! There are no locks anywhere: every transition is a versioned
//! compare-and-swap, and a lost swap re-reads and re-decides.

mod job;
mod ops;
mod region;
mod store;

pub use job::{JobRecord, JobStatus};
pub use ops::{
    claim_region, complete_region, fail_job, record_output_locations, record_region_plan,
    start_job, ClaimOutcome, RegionCompletion, StartOutcome, TileCounts,
};
pub use region::{RegionRecord, RegionStatus};
pub use store::{
    FeatureStore, InMemoryFeatureStore, InMemoryLedger, Ledger, LedgerError, Versioned,
};
