//! Audit processor
//!
//! Drains `COMPLETED` attachments: extract invoice fields, run the policy
//! and price checks concurrently, score completeness inline, check the
//! invoice against the uniqueness index and persist the verdict as
//! `PROCESSED`. Hard failures end in `AUDIT_FAILED`.

pub mod decision;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use expense_core::models::{
    Attachment, AttachmentAuditResult, AttachmentStatus, AuditDecision, DuplicateInfo, InvoiceData,
    PolicyCheckResult, PriceCheckResult, PriceVerification,
};
use expense_core::{AuditService, InvoiceExtractor, PipelineConfig, PipelineError};
use expense_db::{AttachmentStore, InstanceStore, InvoiceIndex};

use crate::notifier::Notifier;
use crate::worker::{CycleReport, PollTask};

pub use decision::{check_completeness, decide};

pub const DUPLICATE_CHECK_UNAVAILABLE: &str = "Duplicate check unavailable";

#[derive(Debug, Clone)]
pub struct AuditProcessorConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Bound on the whole per-attachment audit.
    pub item_timeout: Duration,
    /// Bound on each of the policy and price checks.
    pub check_timeout: Duration,
    /// Lower-case extensions without the dot.
    pub supported_extensions: Vec<String>,
}

impl Default for AuditProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 5,
            item_timeout: Duration::from_secs(180),
            check_timeout: Duration::from_secs(60),
            supported_extensions: ["pdf", "jpg", "jpeg", "png", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl From<&PipelineConfig> for AuditProcessorConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.audit_poll_interval(),
            batch_size: config.audit_batch_size,
            item_timeout: config.audit_item_timeout(),
            check_timeout: config.audit_check_timeout(),
            supported_extensions: config
                .supported_extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }
}

/// Terminal status written for one attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditOutcome {
    Audited(AuditDecision),
    /// Extension not audited; stored as `PROCESSED` without a payload.
    Skipped { extension: String },
    Failed { reason: String },
}

enum AuditStep {
    Audited(Box<AttachmentAuditResult>),
    Unsupported(String),
}

pub struct AuditProcessor {
    attachments: Arc<dyn AttachmentStore>,
    instances: Arc<dyn InstanceStore>,
    extractor: Arc<dyn InvoiceExtractor>,
    auditor: Arc<dyn AuditService>,
    invoice_index: Option<Arc<dyn InvoiceIndex>>,
    notifier: Option<Arc<Notifier>>,
    config: AuditProcessorConfig,
}

impl AuditProcessor {
    pub fn new(
        attachments: Arc<dyn AttachmentStore>,
        instances: Arc<dyn InstanceStore>,
        extractor: Arc<dyn InvoiceExtractor>,
        auditor: Arc<dyn AuditService>,
        config: AuditProcessorConfig,
    ) -> Self {
        Self {
            attachments,
            instances,
            extractor,
            auditor,
            invoice_index: None,
            notifier: None,
            config,
        }
    }

    pub fn with_invoice_index(mut self, index: Arc<dyn InvoiceIndex>) -> Self {
        self.invoice_index = Some(index);
        self
    }

    /// Notify after each terminal write; the notifier's readiness gate decides
    /// whether anything is sent.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &AuditProcessorConfig {
        &self.config
    }

    /// Return rows left in `PROCESSING` by a previous run to `COMPLETED`.
    pub async fn reset_stale_processing(&self) -> Result<u64> {
        self.attachments
            .reset_stale_processing()
            .await
            .context("Failed to reset stale processing attachments")
    }

    pub async fn process_batch(&self) -> Result<CycleReport> {
        let batch = self
            .attachments
            .get_completed(self.config.batch_size)
            .await
            .context("Failed to fetch completed attachments")?;

        let mut report = CycleReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        tracing::debug!(count = batch.len(), "Auditing attachments");

        for attachment in &batch {
            match self.process_attachment(attachment).await {
                Ok(outcome) => report.record(!matches!(outcome, AuditOutcome::Failed { .. })),
                Err(e) => {
                    tracing::error!(
                        attachment_id = %attachment.id,
                        instance_id = %attachment.instance_id,
                        error = %e,
                        "Failed to record audit outcome"
                    );
                    report.record(false);
                }
            }
        }

        Ok(report)
    }

    /// Audit one attachment end to end. `Err` only when the status writes
    /// themselves fail.
    #[tracing::instrument(skip(self, attachment), fields(attachment_id = %attachment.id, instance_id = %attachment.instance_id))]
    pub async fn process_attachment(&self, attachment: &Attachment) -> Result<AuditOutcome> {
        self.attachments
            .update_processing_status(attachment.id, AttachmentStatus::Processing, None, None)
            .await?;

        let outcome = match timeout(self.config.item_timeout, self.audit(attachment)).await {
            Ok(Ok(AuditStep::Audited(result))) => {
                let decision = result.decision;
                let payload = serde_json::to_value(&*result).map_err(PipelineError::from)?;
                self.attachments
                    .update_processing_status(
                        attachment.id,
                        AttachmentStatus::Processed,
                        Some(payload),
                        None,
                    )
                    .await?;
                tracing::info!(
                    decision = %decision,
                    confidence = result.confidence,
                    "Attachment audited"
                );
                AuditOutcome::Audited(decision)
            }
            Ok(Ok(AuditStep::Unsupported(extension))) => {
                let message = format!("unsupported file type '{}', audit skipped", extension);
                self.attachments
                    .update_processing_status(
                        attachment.id,
                        AttachmentStatus::Processed,
                        None,
                        Some(&message),
                    )
                    .await?;
                tracing::info!(extension = %extension, "Attachment skipped, unsupported type");
                AuditOutcome::Skipped { extension }
            }
            Ok(Err(e)) => {
                let reason = format!("audit failed: {:#}", e);
                self.mark_audit_failed(attachment, &reason).await?;
                AuditOutcome::Failed { reason }
            }
            Err(_) => {
                let reason = format!(
                    "audit timed out after {}s",
                    self.config.item_timeout.as_secs()
                );
                self.mark_audit_failed(attachment, &reason).await?;
                AuditOutcome::Failed { reason }
            }
        };

        if let Some(notifier) = &self.notifier {
            notifier.notify_async(attachment.instance_id.clone());
        }

        Ok(outcome)
    }

    async fn mark_audit_failed(&self, attachment: &Attachment, reason: &str) -> Result<()> {
        tracing::warn!(reason = %reason, "Attachment audit failed");
        self.attachments
            .update_processing_status(attachment.id, AttachmentStatus::AuditFailed, None, Some(reason))
            .await
    }

    async fn audit(&self, attachment: &Attachment) -> Result<AuditStep> {
        let extension = attachment.extension().unwrap_or_default();
        if !self.config.supported_extensions.contains(&extension) {
            return Ok(AuditStep::Unsupported(extension));
        }

        let file_path = attachment.file_path.as_deref().ok_or_else(|| {
            PipelineError::InvalidState(format!("attachment {} has no stored file", attachment.id))
        })?;

        let invoice = self
            .extractor
            .extract(file_path)
            .await
            .context("invoice extraction failed")?;

        let (claimed_amount, category) = match self
            .instances
            .get_by_id(&attachment.instance_id)
            .await
            .context("Failed to load approval instance")?
        {
            Some(instance) => instance.resolve_claim(&attachment.item_id, invoice.total_amount),
            None => {
                tracing::warn!("Approval instance not found, using extracted total as claim");
                (invoice.total_amount, "other".to_string())
            }
        };

        let (mut policy, price_check, price_degraded) =
            self.run_checks(&invoice, &category, claimed_amount).await;
        let price = PriceVerification::new(
            claimed_amount,
            invoice.total_amount,
            price_check,
            price_degraded,
        );
        let completeness = check_completeness(&invoice);
        let (mut decision, confidence) = decide(&policy, &price, &completeness);

        let duplicate = self
            .check_duplicate(attachment, &invoice, &mut policy, &mut decision)
            .await;

        Ok(AuditStep::Audited(Box::new(AttachmentAuditResult {
            decision,
            confidence,
            invoice,
            claimed_amount,
            category,
            policy,
            price,
            completeness,
            duplicate,
            audited_at: Utc::now(),
        })))
    }

    /// Policy and price checks side by side, each under its own timeout. A
    /// failed or timed-out check becomes a degraded zero-confidence result.
    async fn run_checks(
        &self,
        invoice: &InvoiceData,
        category: &str,
        claimed_amount: f64,
    ) -> (PolicyCheckResult, PriceCheckResult, bool) {
        let check_timeout = self.config.check_timeout;
        let (policy, price) = tokio::join!(
            timeout(check_timeout, self.auditor.check_policy(invoice, category)),
            timeout(check_timeout, self.auditor.check_price(invoice, claimed_amount)),
        );

        let policy = match policy {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Policy check failed, using degraded result");
                PolicyCheckResult::degraded()
            }
            Err(_) => {
                tracing::warn!("Policy check timed out, using degraded result");
                PolicyCheckResult::degraded()
            }
        };

        let (price, price_degraded) = match price {
            Ok(Ok(result)) => (result, false),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Price check failed, using degraded result");
                (PriceCheckResult::degraded("price check unavailable"), true)
            }
            Err(_) => {
                tracing::warn!("Price check timed out, using degraded result");
                (PriceCheckResult::degraded("price check timed out"), true)
            }
        };

        (policy, price, price_degraded)
    }

    async fn check_duplicate(
        &self,
        attachment: &Attachment,
        invoice: &InvoiceData,
        policy: &mut PolicyCheckResult,
        decision: &mut AuditDecision,
    ) -> Option<DuplicateInfo> {
        let index = self.invoice_index.as_ref()?;
        let invoice_key = invoice.invoice_key()?;

        match index
            .claim(&invoice_key, &attachment.instance_id, attachment.id)
            .await
        {
            Ok(Some(prior_instance_id)) => {
                policy.compliant = false;
                policy.violations.push(format!(
                    "Duplicate invoice {} already claimed by instance {}",
                    invoice_key, prior_instance_id
                ));
                *decision = AuditDecision::Fail;
                Some(DuplicateInfo {
                    invoice_key,
                    prior_instance_id,
                })
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    invoice_key = %invoice_key,
                    error = %e,
                    "Duplicate invoice check unavailable"
                );
                policy.violations.push(DUPLICATE_CHECK_UNAVAILABLE.to_string());
                if *decision == AuditDecision::Pass {
                    *decision = AuditDecision::NeedsReview;
                }
                None
            }
        }
    }
}

#[async_trait]
impl PollTask for AuditProcessor {
    fn name(&self) -> &'static str {
        "audit_processor"
    }

    async fn on_start(&self) -> Result<()> {
        let reset = self.reset_stale_processing().await?;
        if reset > 0 {
            tracing::warn!(count = reset, "Returned stale PROCESSING attachments to COMPLETED");
        }
        Ok(())
    }

    /// Audits the next batch, then retries notifications left `FAILED`
    /// by earlier deliveries.
    async fn run_cycle(&self) -> Result<CycleReport> {
        let report = self.process_batch().await?;
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.retry_failed(self.config.batch_size).await {
                tracing::warn!(error = %e, "Failed to retry failed notifications");
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use expense_core::models::NotificationStatus;

    struct Fixture {
        stores: MockStores,
        extractor: Arc<MockExtractor>,
        auditor: Arc<MockAuditService>,
        processor: AuditProcessor,
    }

    fn fixture(config: AuditProcessorConfig) -> Fixture {
        let stores = MockStores::new();
        let extractor = Arc::new(MockExtractor::new());
        let auditor = Arc::new(MockAuditService::passing());
        let processor = AuditProcessor::new(
            stores.attachments.clone(),
            stores.instances.clone(),
            extractor.clone(),
            auditor.clone(),
            config,
        )
        .with_invoice_index(stores.invoice_index.clone());
        Fixture {
            stores,
            extractor,
            auditor,
            processor,
        }
    }

    fn downloaded(instance_id: &str, file_name: &str) -> Attachment {
        let mut attachment = make_attachment(instance_id, AttachmentStatus::Completed);
        attachment.file_name = file_name.to_string();
        attachment.file_path = Some(format!("/data/{}", file_name));
        attachment
    }

    fn stored_result(f: &Fixture, id: uuid::Uuid) -> AttachmentAuditResult {
        let stored = f.stores.attachments.get(id).unwrap();
        AttachmentAuditResult::from_payload(stored.audit_result.as_ref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn clean_invoice_passes() {
        let f = fixture(AuditProcessorConfig::default());
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        let attachment = downloaded("inst-1", "hotel.pdf");
        f.stores.attachments.insert(attachment.clone());
        f.extractor.set("/data/hotel.pdf", sample_invoice("011", "123", 100.0));

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();

        assert_eq!(outcome, AuditOutcome::Audited(AuditDecision::Pass));
        let stored = f.stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::Processed);
        assert!(stored.processed_at.is_some());
        let result = stored_result(&f, attachment.id);
        assert_eq!(result.claimed_amount, 100.0);
        assert_eq!(result.category, "travel");
        assert!(result.duplicate.is_none());
    }

    #[tokio::test]
    async fn unsupported_extension_is_processed_without_payload() {
        let f = fixture(AuditProcessorConfig::default());
        let attachment = downloaded("inst-1", "notes.docx");
        f.stores.attachments.insert(attachment.clone());

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();

        assert_eq!(
            outcome,
            AuditOutcome::Skipped {
                extension: "docx".to_string()
            }
        );
        let stored = f.stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::Processed);
        assert!(stored.audit_result.is_none());
        assert_eq!(f.extractor.calls(), 0);
    }

    #[tokio::test]
    async fn extraction_error_is_audit_failed() {
        let f = fixture(AuditProcessorConfig::default());
        let attachment = downloaded("inst-1", "blurry.jpg");
        f.stores.attachments.insert(attachment.clone());

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();

        assert!(matches!(outcome, AuditOutcome::Failed { .. }));
        let stored = f.stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::AuditFailed);
        assert!(stored.error_message.unwrap().contains("extraction"));
    }

    #[tokio::test]
    async fn failed_policy_check_degrades_instead_of_aborting() {
        let f = fixture(AuditProcessorConfig::default());
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        let attachment = downloaded("inst-1", "taxi.png");
        f.stores.attachments.insert(attachment.clone());
        f.extractor.set("/data/taxi.png", sample_invoice("011", "124", 100.0));
        f.auditor.fail_policy("model overloaded");

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();

        // Degraded policy is non-compliant with zero confidence: review, not fail.
        assert_eq!(outcome, AuditOutcome::Audited(AuditDecision::NeedsReview));
        let result = stored_result(&f, attachment.id);
        assert!(result.policy.degraded);
        assert_eq!(result.policy.confidence, 0.0);
        // Price signal survives.
        assert!(result.price.reasonable);
        assert!(!result.price.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_price_check_times_out_into_degraded_result() {
        let config = AuditProcessorConfig {
            check_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let f = fixture(config);
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        let attachment = downloaded("inst-1", "dinner.pdf");
        f.stores.attachments.insert(attachment.clone());
        f.extractor.set("/data/dinner.pdf", sample_invoice("011", "125", 100.0));
        f.auditor.set_price_delay(Duration::from_secs(30));

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();

        assert_eq!(outcome, AuditOutcome::Audited(AuditDecision::NeedsReview));
        let result = stored_result(&f, attachment.id);
        assert!(result.price.degraded);
        assert_eq!(result.price.confidence, 0.0);
        assert!(!result.policy.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn item_timeout_marks_audit_failed() {
        let config = AuditProcessorConfig {
            item_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let f = fixture(config);
        let attachment = downloaded("inst-1", "slow.pdf");
        f.stores.attachments.insert(attachment.clone());
        f.extractor.set("/data/slow.pdf", sample_invoice("011", "126", 100.0));
        f.extractor.set_delay(Duration::from_secs(60));

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();

        assert_eq!(
            outcome,
            AuditOutcome::Failed {
                reason: "audit timed out after 10s".to_string()
            }
        );
        assert_eq!(
            f.stores.attachments.get(attachment.id).unwrap().status,
            AttachmentStatus::AuditFailed
        );
    }

    #[tokio::test]
    async fn duplicate_invoice_fails_with_violation() {
        let f = fixture(AuditProcessorConfig::default());
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        f.stores.instances.insert(make_instance("inst-2", 100.0));
        let first = downloaded("inst-1", "a.pdf");
        let second = downloaded("inst-2", "b.pdf");
        f.stores.attachments.insert(first.clone());
        f.stores.attachments.insert(second.clone());
        f.extractor.set("/data/a.pdf", sample_invoice("011", "777", 100.0));
        f.extractor.set("/data/b.pdf", sample_invoice(" 011 ", "777", 100.0));

        f.processor.process_attachment(&first).await.unwrap();
        let outcome = f.processor.process_attachment(&second).await.unwrap();

        assert_eq!(outcome, AuditOutcome::Audited(AuditDecision::Fail));
        let result = stored_result(&f, second.id);
        assert_eq!(
            result.policy.violations,
            vec!["Duplicate invoice 011:777 already claimed by instance inst-1"]
        );
        assert_eq!(result.duplicate.unwrap().prior_instance_id, "inst-1");
    }

    #[tokio::test]
    async fn same_instance_reclaim_is_not_a_duplicate() {
        let f = fixture(AuditProcessorConfig::default());
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        f.stores.invoice_index.preload("011:888", "inst-1");
        let attachment = downloaded("inst-1", "a.pdf");
        f.stores.attachments.insert(attachment.clone());
        f.extractor.set("/data/a.pdf", sample_invoice("011", "888", 100.0));

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();
        assert_eq!(outcome, AuditOutcome::Audited(AuditDecision::Pass));
    }

    #[tokio::test]
    async fn unavailable_index_escalates_pass_to_review() {
        let f = fixture(AuditProcessorConfig::default());
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        f.stores.invoice_index.set_unavailable(true);
        let attachment = downloaded("inst-1", "a.pdf");
        f.stores.attachments.insert(attachment.clone());
        f.extractor.set("/data/a.pdf", sample_invoice("011", "999", 100.0));

        let outcome = f.processor.process_attachment(&attachment).await.unwrap();

        assert_eq!(outcome, AuditOutcome::Audited(AuditDecision::NeedsReview));
        let result = stored_result(&f, attachment.id);
        assert_eq!(result.policy.violations, vec![DUPLICATE_CHECK_UNAVAILABLE]);
    }

    #[tokio::test]
    async fn on_start_resets_stale_processing_rows() {
        let f = fixture(AuditProcessorConfig::default());
        let stuck = make_attachment("inst-1", AttachmentStatus::Processing);
        f.stores.attachments.insert(stuck.clone());

        f.processor.on_start().await.unwrap();

        assert_eq!(
            f.stores.attachments.get(stuck.id).unwrap().status,
            AttachmentStatus::Completed
        );
    }

    #[tokio::test]
    async fn cycle_retries_failed_notifications() {
        let stores = MockStores::new();
        let platform = Arc::new(MockApprovalPlatform::new());
        let notifier = Arc::new(Notifier::new(
            stores.attachments.clone(),
            stores.instances.clone(),
            stores.notifications.clone(),
            platform.clone(),
        ));
        let processor = AuditProcessor::new(
            stores.attachments.clone(),
            stores.instances.clone(),
            Arc::new(MockExtractor::new()),
            Arc::new(MockAuditService::passing()),
            AuditProcessorConfig::default(),
        )
        .with_notifier(notifier.clone());
        stores.instances.insert(make_instance("inst-1", 100.0));
        stores.attachments.insert(audited_attachment(
            "inst-1",
            audit_result(AuditDecision::Pass, 0.9, 100.0),
        ));
        platform.set_approvers("inst-1", vec![approver("mgr-1")]);
        platform.fail_recipient("mgr-1");
        notifier.notify("inst-1").await.unwrap();
        platform.clear_failures();

        let report = processor.run_cycle().await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(platform.sent().len(), 1);
        assert_eq!(
            stores.notifications.get("inst-1").unwrap().status,
            NotificationStatus::Sent
        );
    }

    #[tokio::test]
    async fn batch_processes_completed_rows_in_order() {
        let f = fixture(AuditProcessorConfig::default());
        f.stores.instances.insert(make_instance("inst-1", 100.0));
        for (i, name) in ["one.pdf", "two.pdf", "three.docx"].iter().enumerate() {
            let attachment = downloaded("inst-1", name);
            f.stores.attachments.insert(attachment);
            f.extractor.set(
                &format!("/data/{}", name),
                sample_invoice("011", &format!("50{}", i), 100.0),
            );
        }

        let report = f.processor.process_batch().await.unwrap();

        assert_eq!(report, CycleReport { processed: 3, failed: 0 });
        assert_eq!(
            f.stores
                .attachments
                .count_with_status("inst-1", AttachmentStatus::Processed),
            3
        );
    }
}
