//! In-memory store doubles
//!
//! They mirror the PostgreSQL repositories closely enough for worker tests:
//! rows are kept in insertion order (creation order) and status writes are
//! checked against the attachment transition table.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use expense_core::models::{
    ApprovalInstance, Attachment, AttachmentStatus, AuditNotification, InstanceStatus,
    NotificationSnapshot, NotificationStatus,
};
use expense_core::PipelineError;
use expense_db::{AttachmentStore, InstanceStore, InvoiceIndex, NotificationStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::pipeline::Stores;

/// Every store double, sharing nothing but the test's lifetime.
#[derive(Clone)]
pub struct MockStores {
    pub attachments: Arc<MockAttachmentStore>,
    pub instances: Arc<MockInstanceStore>,
    pub notifications: Arc<MockNotificationStore>,
    pub invoice_index: Arc<MockInvoiceIndex>,
}

impl MockStores {
    pub fn new() -> Self {
        Self {
            attachments: Arc::new(MockAttachmentStore::new()),
            instances: Arc::new(MockInstanceStore::new()),
            notifications: Arc::new(MockNotificationStore::new()),
            invoice_index: Arc::new(MockInvoiceIndex::new()),
        }
    }

    pub fn as_stores(&self) -> Stores {
        Stores {
            attachments: self.attachments.clone(),
            instances: self.instances.clone(),
            notifications: self.notifications.clone(),
            invoice_index: Some(self.invoice_index.clone()),
        }
    }
}

impl Default for MockStores {
    fn default() -> Self {
        Self::new()
    }
}

/// Mock attachment store for testing without database
#[derive(Clone, Default)]
pub struct MockAttachmentStore {
    rows: Arc<Mutex<Vec<Attachment>>>,
    count_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay `get_unprocessed_count` after it has read the rows, so the
    /// returned count can go stale while the caller waits.
    pub fn set_count_delay(&self, delay: Duration) {
        *self.count_delay.lock().unwrap() = Some(delay);
    }

    pub fn insert(&self, attachment: Attachment) {
        self.rows.lock().unwrap().push(attachment);
    }

    pub fn get(&self, id: Uuid) -> Option<Attachment> {
        self.rows.lock().unwrap().iter().find(|a| a.id == id).cloned()
    }

    pub fn all(&self) -> Vec<Attachment> {
        self.rows.lock().unwrap().clone()
    }

    pub fn count_with_status(&self, instance_id: &str, status: AttachmentStatus) -> usize {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.instance_id == instance_id && a.status == status)
            .count()
    }

    fn with_status(&self, status: AttachmentStatus, limit: i64) -> Vec<Attachment> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect()
    }

    /// Apply `update` if the row exists and may move to `to`.
    fn transition<F>(&self, id: Uuid, to: AttachmentStatus, update: F) -> Result<()>
    where
        F: FnOnce(&mut Attachment),
    {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("attachment {}", id)))?;
        if !row.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: row.status,
                to,
            }
            .into());
        }
        row.status = to;
        update(row);
        Ok(())
    }

    fn move_all(&self, from: AttachmentStatus, to: AttachmentStatus, instance_id: Option<&str>) -> u64 {
        let mut moved = 0;
        for row in self.rows.lock().unwrap().iter_mut() {
            let in_scope = instance_id.map(|id| row.instance_id == id).unwrap_or(true);
            if in_scope && row.status == from {
                row.status = to;
                row.error_message = None;
                moved += 1;
            }
        }
        moved
    }
}

#[async_trait]
impl AttachmentStore for MockAttachmentStore {
    async fn get_pending(&self, limit: i64) -> Result<Vec<Attachment>> {
        Ok(self.with_status(AttachmentStatus::Pending, limit))
    }

    async fn get_completed(&self, limit: i64) -> Result<Vec<Attachment>> {
        Ok(self.with_status(AttachmentStatus::Completed, limit))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Attachment>> {
        Ok(self.get(id))
    }

    async fn get_by_instance_id(&self, instance_id: &str) -> Result<Vec<Attachment>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.transition(id, status, |row| {
            row.error_message = error_message.map(str::to_string);
        })
    }

    async fn mark_download_completed(
        &self,
        id: Uuid,
        file_path: &str,
        file_size: i64,
        mime_type: Option<&str>,
    ) -> Result<()> {
        self.transition(id, AttachmentStatus::Completed, |row| {
            row.file_path = Some(file_path.to_string());
            row.file_size = Some(file_size);
            if let Some(mime) = mime_type {
                row.mime_type = Some(mime.to_string());
            }
            row.error_message = None;
            row.downloaded_at = Some(Utc::now());
        })
    }

    async fn update_processing_status(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        audit_result: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.transition(id, status, |row| {
            if audit_result.is_some() {
                row.audit_result = audit_result;
            }
            row.error_message = error_message.map(str::to_string);
            if status.is_terminal() {
                row.processed_at = Some(Utc::now());
            }
        })
    }

    async fn get_total_count(&self, instance_id: &str) -> Result<i64> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .count() as i64)
    }

    async fn get_unprocessed_count(&self, instance_id: &str) -> Result<i64> {
        let count = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.instance_id == instance_id && !a.status.is_processed())
            .count() as i64;
        let delay = *self.count_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(count)
    }

    async fn requeue_failed(&self, instance_id: &str) -> Result<u64> {
        Ok(self.move_all(
            AttachmentStatus::Failed,
            AttachmentStatus::Pending,
            Some(instance_id),
        ))
    }

    async fn reset_stale_processing(&self) -> Result<u64> {
        Ok(self.move_all(AttachmentStatus::Processing, AttachmentStatus::Completed, None))
    }
}

/// Mock instance store for testing without database
#[derive(Clone, Default)]
pub struct MockInstanceStore {
    rows: Arc<Mutex<Vec<ApprovalInstance>>>,
}

impl MockInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance: ApprovalInstance) {
        self.rows.lock().unwrap().push(instance);
    }

    pub fn get(&self, instance_id: &str) -> Option<ApprovalInstance> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned()
    }

    fn update<F>(&self, instance_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut ApprovalInstance),
    {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| PipelineError::NotFound(format!("instance {}", instance_id)))?;
        update(row);
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MockInstanceStore {
    async fn get_by_id(&self, instance_id: &str) -> Result<Option<ApprovalInstance>> {
        Ok(self.get(instance_id))
    }

    async fn list_non_terminal(&self, limit: i64) -> Result<Vec<ApprovalInstance>> {
        let mut rows: Vec<ApprovalInstance> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|i| !i.status.is_terminal())
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.updated_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update(instance_id, |row| {
            row.status = status;
            if approved_at.is_some() {
                row.approved_at = approved_at;
            }
        })
    }

    async fn update_audit_summary(&self, instance_id: &str, summary: serde_json::Value) -> Result<()> {
        self.update(instance_id, |row| row.audit_summary = Some(summary))
    }
}

/// Mock notification store, one row per instance
#[derive(Clone, Default)]
pub struct MockNotificationStore {
    rows: Arc<Mutex<HashMap<String, AuditNotification>>>,
}

impl MockNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: &str) -> Option<AuditNotification> {
        self.rows.lock().unwrap().get(instance_id).cloned()
    }

    pub fn count_with_status(&self, status: NotificationStatus) -> usize {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.status == status)
            .count()
    }

    fn finish(
        &self,
        id: Uuid,
        status: NotificationStatus,
        approver_count: i32,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .values_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("notification {}", id)))?;
        let now = Utc::now();
        row.status = status;
        row.approver_count = approver_count;
        row.error_message = error_message.map(str::to_string);
        row.updated_at = now;
        if status == NotificationStatus::Sent {
            row.sent_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MockNotificationStore {
    async fn get_by_instance_id(&self, instance_id: &str) -> Result<Option<AuditNotification>> {
        Ok(self.get(instance_id))
    }

    async fn upsert_pending(&self, snapshot: &NotificationSnapshot) -> Result<AuditNotification> {
        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = rows.get(&snapshot.instance_id) {
            if existing.is_sent() {
                return Err(PipelineError::InvalidState(format!(
                    "notification for {} already sent",
                    snapshot.instance_id
                ))
                .into());
            }
        }

        let (id, created_at) = rows
            .get(&snapshot.instance_id)
            .map(|n| (n.id, n.created_at))
            .unwrap_or_else(|| (Uuid::new_v4(), now));
        let row = AuditNotification {
            id,
            instance_id: snapshot.instance_id.clone(),
            status: NotificationStatus::Pending,
            decision: snapshot.decision,
            confidence: snapshot.confidence,
            total_amount: snapshot.total_amount,
            violations: snapshot.violations.clone(),
            approver_count: snapshot.approver_count,
            error_message: None,
            created_at,
            updated_at: now,
            sent_at: None,
        };
        rows.insert(snapshot.instance_id.clone(), row.clone());
        Ok(row)
    }

    async fn mark_sent(&self, id: Uuid, approver_count: i32) -> Result<()> {
        self.finish(id, NotificationStatus::Sent, approver_count, None)
    }

    async fn mark_failed(&self, id: Uuid, approver_count: i32, error_message: &str) -> Result<()> {
        self.finish(id, NotificationStatus::Failed, approver_count, Some(error_message))
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<AuditNotification>> {
        let mut failed: Vec<AuditNotification> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.status == NotificationStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|n| n.updated_at);
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }
}

/// Mock invoice index; `set_unavailable(true)` makes every claim error.
#[derive(Clone, Default)]
pub struct MockInvoiceIndex {
    claims: Arc<Mutex<HashMap<String, String>>>,
    unavailable: Arc<AtomicBool>,
}

impl MockInvoiceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preload(&self, invoice_key: &str, instance_id: &str) {
        self.claims
            .lock()
            .unwrap()
            .insert(invoice_key.to_string(), instance_id.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn owner(&self, invoice_key: &str) -> Option<String> {
        self.claims.lock().unwrap().get(invoice_key).cloned()
    }
}

#[async_trait]
impl InvoiceIndex for MockInvoiceIndex {
    async fn claim(
        &self,
        invoice_key: &str,
        instance_id: &str,
        _attachment_id: Uuid,
    ) -> Result<Option<String>> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("invoice index unavailable");
        }
        let mut claims = self.claims.lock().unwrap();
        let owner = claims
            .entry(invoice_key.to_string())
            .or_insert_with(|| instance_id.to_string());
        Ok((owner.as_str() != instance_id).then(|| owner.clone()))
    }
}
