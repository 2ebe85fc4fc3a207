//! Expense Pipeline Persistence
//!
//! Repository ports (`traits`) consumed by the workers, and their PostgreSQL
//! implementations (`db`). Status columns on `expense_attachments` and
//! `audit_notifications` act as the durable work queue.

pub mod db;
pub mod pool;
pub mod traits;

pub use db::transaction::with_transaction;
pub use db::{
    PgAttachmentRepository, PgInstanceRepository, PgInvoiceIndexRepository,
    PgNotificationRepository,
};
pub use pool::connect_pool;
pub use traits::{AttachmentStore, InstanceStore, InvoiceIndex, NotificationStore};
