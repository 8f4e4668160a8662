//! Batch write missions approved once and executed incrementally by
//! competing workers under a run lease.

pub mod config;
pub mod error;
pub mod manager;
pub mod record;
pub mod report;

pub use config::{BatchConfig, DEFAULT_REPORT_ERROR_NEEDLE};
pub use error::BatchError;
pub use manager::{
    batch_record_name, BatchCreated, BatchManager, BatchRunReport, BlockedTarget,
    CreateBatchRequest,
};
pub use record::{
    BatchOperation, BatchRecord, BatchStatus, BatchSummary, OutcomeKind, RunLease,
    StatusTransitionError, TargetAttempts, TargetOutcome,
};
pub use report::{ReportItem, ReportItemResult, RunReport};
