//! Expense Pipeline Workers
//!
//! Independent pollers over the status-tagged attachment table:
//!
//! - [`DownloadWorker`]: `PENDING -> COMPLETED | FAILED`
//! - [`AuditProcessor`]: `COMPLETED -> PROCESSING -> PROCESSED | AUDIT_FAILED`
//! - [`StatusPoller`]: reconciles instance status with the approval platform
//!
//! Once every attachment of an instance is processed, [`Notifier`] aggregates
//! the verdicts and delivers them to the approvers once.
//! [`WorkerManager`] owns the lifecycle of all pollers.

pub mod aggregator;
pub mod audit;
pub mod download;
pub mod manager;
pub mod notifier;
pub mod pipeline;
pub mod readiness;
pub mod status_poller;
pub mod worker;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use aggregator::aggregate;
pub use audit::{AuditOutcome, AuditProcessor, AuditProcessorConfig};
pub use download::{DownloadOutcome, DownloadWorker, DownloadWorkerConfig};
pub use manager::WorkerManager;
pub use notifier::{Notifier, NotifyOutcome};
pub use pipeline::{build_worker_manager, http_fetcher, PipelinePorts, Stores};
pub use readiness::{is_fully_processed, ready_for_notification};
pub use status_poller::{StatusPoller, StatusPollerConfig, StatusSyncHandler};
pub use worker::{CycleReport, PollTask, PollingWorker, Worker, WorkerStatus};
