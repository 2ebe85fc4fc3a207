//! Approver notification
//!
//! Sends the aggregated instance verdict once. The `audit_notifications` row
//! is the idempotency key: `SENT` is final, `PENDING`/`FAILED` rows are
//! retried in place on the next call.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use expense_core::models::{AuditNotice, NotificationSnapshot};
use expense_core::{ApprovalPlatform, Approver};
use expense_db::{AttachmentStore, InstanceStore, NotificationStore};

use crate::aggregator::aggregate;
use crate::readiness::ready_for_notification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Attachments still in flight, or the instance has none.
    NotReady,
    AlreadySent,
    Sent { recipients: usize, delivered: usize },
    Failed { error: String },
}

pub struct Notifier {
    attachments: Arc<dyn AttachmentStore>,
    instances: Arc<dyn InstanceStore>,
    notifications: Arc<dyn NotificationStore>,
    platform: Arc<dyn ApprovalPlatform>,
    locks: InstanceLocks,
}

/// One async lock per instance id. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Default)]
struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    async fn lock(&self, instance_id: &str) -> InstanceLockGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance_id.to_string())
            .or_default()
            .clone();
        InstanceLockGuard {
            locks: self,
            instance_id: instance_id.to_string(),
            _held: lock.lock_owned().await,
        }
    }
}

struct InstanceLockGuard<'a> {
    locks: &'a InstanceLocks,
    instance_id: String,
    _held: OwnedMutexGuard<()>,
}

impl Drop for InstanceLockGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this guard are the only owners: no waiters.
        let idle = locks
            .get(&self.instance_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            locks.remove(&self.instance_id);
        }
    }
}

impl Notifier {
    pub fn new(
        attachments: Arc<dyn AttachmentStore>,
        instances: Arc<dyn InstanceStore>,
        notifications: Arc<dyn NotificationStore>,
        platform: Arc<dyn ApprovalPlatform>,
    ) -> Self {
        Self {
            attachments,
            instances,
            notifications,
            platform,
            locks: InstanceLocks::default(),
        }
    }

    /// Calls for the same instance run one at a time; a call that waited
    /// re-reads readiness and the `SENT` row, so a trigger arriving while an
    /// earlier one is running is never lost.
    #[tracing::instrument(skip(self))]
    pub async fn notify(&self, instance_id: &str) -> Result<NotifyOutcome> {
        let _guard = self.locks.lock(instance_id).await;

        let total = self
            .attachments
            .get_total_count(instance_id)
            .await
            .context("Failed to count attachments")?;
        let unprocessed = self
            .attachments
            .get_unprocessed_count(instance_id)
            .await
            .context("Failed to count unprocessed attachments")?;
        if !ready_for_notification(total, unprocessed) {
            tracing::debug!(total, unprocessed, "Instance not ready for notification");
            return Ok(NotifyOutcome::NotReady);
        }

        if let Some(existing) = self
            .notifications
            .get_by_instance_id(instance_id)
            .await
            .context("Failed to load notification row")?
        {
            if existing.is_sent() {
                tracing::debug!(notification_id = %existing.id, "Notification already sent");
                return Ok(NotifyOutcome::AlreadySent);
            }
        }

        let attachments = self
            .attachments
            .get_by_instance_id(instance_id)
            .await
            .context("Failed to load attachments")?;
        let aggregated = aggregate(instance_id, &attachments);

        let recipients = self.recipients(instance_id).await?;

        let snapshot = NotificationSnapshot::from_aggregate(instance_id, &aggregated, recipients.len());
        let row = self
            .notifications
            .upsert_pending(&snapshot)
            .await
            .context("Failed to record pending notification")?;

        match serde_json::to_value(&aggregated) {
            Ok(summary) => {
                if let Err(e) = self.instances.update_audit_summary(instance_id, summary).await {
                    tracing::warn!(error = %e, "Failed to store audit summary on instance");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize audit summary"),
        }

        let notice = AuditNotice::new(instance_id, &aggregated);
        let mut delivered = 0usize;
        let mut last_error = None;
        for recipient in &recipients {
            match self.platform.send_notification(recipient, &notice).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(recipient = %recipient.user_id, error = %e, "Notification delivery failed");
                    last_error = Some(format!("{:#}", e));
                }
            }
        }

        let approver_count = snapshot.approver_count;
        if delivered > 0 {
            self.notifications
                .mark_sent(row.id, approver_count)
                .await
                .context("Failed to mark notification sent")?;
            tracing::info!(
                decision = %aggregated.decision,
                recipients = recipients.len(),
                delivered,
                "Audit notification sent"
            );
            Ok(NotifyOutcome::Sent {
                recipients: recipients.len(),
                delivered,
            })
        } else {
            let error = last_error.unwrap_or_else(|| "no recipients available".to_string());
            self.notifications
                .mark_failed(row.id, approver_count, &error)
                .await
                .context("Failed to mark notification failed")?;
            tracing::warn!(error = %error, "Audit notification failed");
            Ok(NotifyOutcome::Failed { error })
        }
    }

    /// Fire-and-forget `notify`; errors are logged, never propagated.
    pub fn notify_async(self: &Arc<Self>, instance_id: String) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&instance_id).await {
                tracing::error!(instance_id = %instance_id, error = %e, "Notification failed");
            }
        })
    }

    /// Re-run `notify` for up to `limit` `FAILED` rows. Returns how many were
    /// sent this time.
    pub async fn retry_failed(&self, limit: i64) -> Result<usize> {
        let failed = self
            .notifications
            .list_failed(limit)
            .await
            .context("Failed to list failed notifications")?;

        let mut sent = 0;
        for row in &failed {
            match self.notify(&row.instance_id).await {
                Ok(NotifyOutcome::Sent { .. }) => sent += 1,
                Ok(outcome) => {
                    tracing::debug!(instance_id = %row.instance_id, ?outcome, "Notification retry not sent")
                }
                Err(e) => tracing::warn!(
                    instance_id = %row.instance_id,
                    error = %e,
                    "Notification retry failed"
                ),
            }
        }

        if sent > 0 {
            tracing::info!(retried = failed.len(), sent, "Retried failed notifications");
        }
        Ok(sent)
    }

    /// Approvers from the platform, or the applicant when the lookup fails
    /// or returns nobody.
    async fn recipients(&self, instance_id: &str) -> Result<Vec<Approver>> {
        match self.platform.get_approvers(instance_id).await {
            Ok(approvers) if !approvers.is_empty() => return Ok(approvers),
            Ok(_) => tracing::info!("No approvers returned, falling back to applicant"),
            Err(e) => tracing::warn!(error = %e, "Approver lookup failed, falling back to applicant"),
        }

        let instance = self
            .instances
            .get_by_id(instance_id)
            .await
            .context("Failed to load approval instance")?;
        Ok(instance
            .map(|instance| {
                vec![Approver {
                    user_id: instance.applicant_id,
                    name: instance.applicant_name,
                }]
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use expense_core::models::{AttachmentStatus, AuditDecision, NotificationStatus};

    struct Fixture {
        stores: MockStores,
        platform: Arc<MockApprovalPlatform>,
        notifier: Arc<Notifier>,
    }

    fn fixture() -> Fixture {
        let stores = MockStores::new();
        let platform = Arc::new(MockApprovalPlatform::new());
        let notifier = Arc::new(Notifier::new(
            stores.attachments.clone(),
            stores.instances.clone(),
            stores.notifications.clone(),
            platform.clone(),
        ));
        Fixture {
            stores,
            platform,
            notifier,
        }
    }

    fn seed_audited(f: &Fixture, instance_id: &str) {
        f.stores.instances.insert(make_instance(instance_id, 100.0));
        f.stores.attachments.insert(audited_attachment(
            instance_id,
            audit_result(AuditDecision::Pass, 0.9, 100.0),
        ));
    }

    #[tokio::test]
    async fn not_ready_while_attachments_in_flight() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        f.stores
            .attachments
            .insert(make_attachment("inst-1", AttachmentStatus::Completed));

        let outcome = f.notifier.notify("inst-1").await.unwrap();

        assert_eq!(outcome, NotifyOutcome::NotReady);
        assert!(f.stores.notifications.get("inst-1").is_none());
    }

    #[tokio::test]
    async fn zero_attachments_is_not_ready() {
        let f = fixture();
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        assert_eq!(f.notifier.notify("inst-1").await.unwrap(), NotifyOutcome::NotReady);
    }

    #[tokio::test]
    async fn sends_once_and_is_idempotent() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        f.platform.set_approvers(
            "inst-1",
            vec![approver("mgr-1"), approver("mgr-2")],
        );

        let first = f.notifier.notify("inst-1").await.unwrap();
        let second = f.notifier.notify("inst-1").await.unwrap();

        assert_eq!(first, NotifyOutcome::Sent { recipients: 2, delivered: 2 });
        assert_eq!(second, NotifyOutcome::AlreadySent);
        assert_eq!(f.platform.sent().len(), 2);

        let row = f.stores.notifications.get("inst-1").unwrap();
        assert_eq!(row.status, NotificationStatus::Sent);
        assert_eq!(row.approver_count, 2);
        assert!(row.sent_at.is_some());
        assert!(f.stores.instances.get("inst-1").unwrap().audit_summary.is_some());
    }

    #[tokio::test]
    async fn approver_lookup_failure_falls_back_to_applicant() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        f.platform.fail_approver_lookup(true);

        let outcome = f.notifier.notify("inst-1").await.unwrap();

        assert_eq!(outcome, NotifyOutcome::Sent { recipients: 1, delivered: 1 });
        let sent = f.platform.sent();
        assert_eq!(sent[0].0.user_id, "applicant-inst-1");
    }

    #[tokio::test]
    async fn partial_delivery_still_counts_as_sent() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        f.platform
            .set_approvers("inst-1", vec![approver("mgr-1"), approver("mgr-2")]);
        f.platform.fail_recipient("mgr-1");

        let outcome = f.notifier.notify("inst-1").await.unwrap();

        assert_eq!(outcome, NotifyOutcome::Sent { recipients: 2, delivered: 1 });
        assert_eq!(
            f.stores.notifications.get("inst-1").unwrap().status,
            NotificationStatus::Sent
        );
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_on_same_row() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        f.platform.set_approvers("inst-1", vec![approver("mgr-1")]);
        f.platform.fail_recipient("mgr-1");

        let outcome = f.notifier.notify("inst-1").await.unwrap();
        assert!(matches!(outcome, NotifyOutcome::Failed { ref error } if error.contains("mgr-1")));
        let failed = f.stores.notifications.get("inst-1").unwrap();
        assert_eq!(failed.status, NotificationStatus::Failed);

        f.platform.clear_failures();
        let retried = f.notifier.notify("inst-1").await.unwrap();
        assert_eq!(retried, NotifyOutcome::Sent { recipients: 1, delivered: 1 });

        let row = f.stores.notifications.get("inst-1").unwrap();
        assert_eq!(row.id, failed.id);
        assert_eq!(row.status, NotificationStatus::Sent);
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn concurrent_calls_send_once() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        f.platform.set_approvers("inst-1", vec![approver("mgr-1")]);
        f.platform.set_send_delay(std::time::Duration::from_millis(50));

        let (a, b) = tokio::join!(f.notifier.notify("inst-1"), f.notifier.notify("inst-1"));

        assert_eq!(a.unwrap(), NotifyOutcome::Sent { recipients: 1, delivered: 1 });
        assert_eq!(b.unwrap(), NotifyOutcome::AlreadySent);
        assert_eq!(f.platform.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_stale_readiness_check_still_sends() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        let last = make_attachment("inst-1", AttachmentStatus::Processing);
        f.stores.attachments.insert(last.clone());
        f.platform.set_approvers("inst-1", vec![approver("mgr-1")]);
        f.stores
            .attachments
            .set_count_delay(std::time::Duration::from_millis(100));

        // First trigger reads one unprocessed attachment, then stalls.
        let first = f.notifier.notify_async("inst-1".to_string());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let payload = serde_json::to_value(audit_result(AuditDecision::Pass, 0.8, 50.0)).unwrap();
        f.stores
            .attachments
            .update_processing_status(last.id, AttachmentStatus::Processed, Some(payload), None)
            .await
            .unwrap();
        let second = f.notifier.notify("inst-1").await.unwrap();
        first.await.unwrap();

        assert_eq!(second, NotifyOutcome::Sent { recipients: 1, delivered: 1 });
        assert_eq!(f.platform.sent().len(), 1);
        assert_eq!(
            f.stores.notifications.get("inst-1").unwrap().status,
            NotificationStatus::Sent
        );
    }

    #[tokio::test]
    async fn retry_failed_resends_failed_rows() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        seed_audited(&f, "inst-2");
        f.platform.set_approvers("inst-1", vec![approver("mgr-1")]);
        f.platform.set_approvers("inst-2", vec![approver("mgr-2")]);
        f.platform.fail_recipient("mgr-1");
        f.notifier.notify("inst-1").await.unwrap();
        f.notifier.notify("inst-2").await.unwrap();

        // Still rejected: nothing sent, row stays FAILED.
        assert_eq!(f.notifier.retry_failed(10).await.unwrap(), 0);
        assert_eq!(
            f.stores.notifications.get("inst-1").unwrap().status,
            NotificationStatus::Failed
        );

        f.platform.clear_failures();
        assert_eq!(f.notifier.retry_failed(10).await.unwrap(), 1);
        assert_eq!(f.stores.notifications.count_with_status(NotificationStatus::Sent), 2);
        assert_eq!(f.notifier.retry_failed(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn notify_async_returns_a_handle() {
        let f = fixture();
        seed_audited(&f, "inst-1");
        f.platform.set_approvers("inst-1", vec![approver("mgr-1")]);

        f.notifier.notify_async("inst-1".to_string()).await.unwrap();

        assert_eq!(f.platform.sent().len(), 1);
    }
}
