//! PostgreSQL repositories
//!
//! Each repository exposes the trait methods used by the workers plus `*_tx`
//! variants that run on a caller-supplied connection, so multi-statement
//! work can be composed inside [`transaction::with_transaction`].

pub mod attachment;
pub mod instance;
pub mod invoice_index;
pub mod notification;
pub mod transaction;

pub use attachment::PgAttachmentRepository;
pub use instance::PgInstanceRepository;
pub use invoice_index::PgInvoiceIndexRepository;
pub use notification::PgNotificationRepository;
