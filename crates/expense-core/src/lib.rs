//! Expense Pipeline Core Library
//!
//! Domain models, error types, configuration and collaborator ports shared by
//! every crate of the expense-reimbursement pipeline.

pub mod config;
pub mod error;
pub mod models;
pub mod ports;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{ErrorClass, PipelineError};
pub use ports::{
    ApprovalPlatform, Approver, AuditService, EventOrigin, InstanceEvent, InstanceEventHandler,
    InvoiceExtractor, VoucherGenerator,
};
