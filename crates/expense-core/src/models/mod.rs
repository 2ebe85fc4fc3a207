//! Data models for the expense pipeline
//!
//! Attachments and notifications double as a durable work queue: their status
//! columns decide which worker may claim a row next.

mod attachment;
mod audit;
mod instance;
mod notification;

pub use attachment::*;
pub use audit::*;
pub use instance::*;
pub use notification::*;
