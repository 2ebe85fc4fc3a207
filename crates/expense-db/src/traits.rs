//! Repository trait abstractions
//!
//! These traits define the narrow interface the workers need from
//! persistence, allowing them to run against PostgreSQL in production and
//! against in-memory doubles in tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use expense_core::models::{
    ApprovalInstance, Attachment, AttachmentStatus, AuditNotification, InstanceStatus,
    NotificationSnapshot,
};
use uuid::Uuid;

/// Attachment rows as a status-tagged work queue.
///
/// Status changes are validated against
/// [`AttachmentStatus::can_transition_to`]; an illegal move fails with
/// `PipelineError::InvalidTransition` and leaves the row untouched.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// `PENDING` rows, oldest first.
    async fn get_pending(&self, limit: i64) -> Result<Vec<Attachment>>;

    /// `COMPLETED` (downloaded, not yet audited) rows, oldest first.
    async fn get_completed(&self, limit: i64) -> Result<Vec<Attachment>>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Attachment>>;

    async fn get_by_instance_id(&self, instance_id: &str) -> Result<Vec<Attachment>>;

    async fn update_status(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// `PENDING -> COMPLETED` with the stored path, size and download time.
    async fn mark_download_completed(
        &self,
        id: Uuid,
        file_path: &str,
        file_size: i64,
        mime_type: Option<&str>,
    ) -> Result<()>;

    /// Audit-stage transition carrying the serialized audit result.
    async fn update_processing_status(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        audit_result: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn get_total_count(&self, instance_id: &str) -> Result<i64>;

    /// Attachments of the instance not yet in `PROCESSED`/`AUDIT_FAILED`.
    async fn get_unprocessed_count(&self, instance_id: &str) -> Result<i64>;

    /// Operator re-queue: every `FAILED` attachment of the instance back to `PENDING`.
    async fn requeue_failed(&self, instance_id: &str) -> Result<u64>;

    /// Crash recovery: `PROCESSING` rows back to `COMPLETED`.
    async fn reset_stale_processing(&self) -> Result<u64>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_by_id(&self, instance_id: &str) -> Result<Option<ApprovalInstance>>;

    /// Instances not in `APPROVED`/`REJECTED`/`COMPLETED`, least recently updated first.
    async fn list_non_terminal(&self, limit: i64) -> Result<Vec<ApprovalInstance>>;

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn update_audit_summary(&self, instance_id: &str, summary: serde_json::Value) -> Result<()>;
}

/// Notification rows; one per instance, used as the idempotency key.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn get_by_instance_id(&self, instance_id: &str) -> Result<Option<AuditNotification>>;

    /// Create the row in `PENDING`, or reset an existing `PENDING`/`FAILED`
    /// row (keeping its id) with a fresh snapshot. Fails if the row is `SENT`.
    async fn upsert_pending(&self, snapshot: &NotificationSnapshot) -> Result<AuditNotification>;

    async fn mark_sent(&self, id: Uuid, approver_count: i32) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, approver_count: i32, error_message: &str) -> Result<()>;

    /// `FAILED` rows, least recently attempted first.
    async fn list_failed(&self, limit: i64) -> Result<Vec<AuditNotification>>;
}

/// Invoice uniqueness index keyed by `CODE:NUMBER`.
#[async_trait]
pub trait InvoiceIndex: Send + Sync {
    /// Record the claim if the key is new. Returns the id of a *different*
    /// instance that claimed the key first, if any.
    async fn claim(
        &self,
        invoice_key: &str,
        instance_id: &str,
        attachment_id: Uuid,
    ) -> Result<Option<String>>;
}
