//! Download worker
//!
//! Drains `PENDING` attachments: fetch from the source URL with retry, store
//! under an instance-scoped key and mark `COMPLETED`. Every failure is
//! terminal (`FAILED`) with the error class recorded in the message;
//! `requeue_failed` is the explicit way back to `PENDING`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use expense_core::models::{Attachment, AttachmentStatus};
use expense_core::{PipelineConfig, VoucherGenerator};
use expense_db::AttachmentStore;
use expense_infra::Fetcher;
use expense_storage::{attachment_key, Storage};

use crate::worker::{CycleReport, PollTask};

#[derive(Debug, Clone)]
pub struct DownloadWorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Total fetch attempts per attachment, first attempt included.
    pub max_attempts: u32,
    /// Bound on the whole fetch, retries and backoff included.
    pub download_timeout: Duration,
    pub credential: Option<String>,
}

impl Default for DownloadWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            max_attempts: 3,
            download_timeout: Duration::from_secs(60),
            credential: None,
        }
    }
}

impl From<&PipelineConfig> for DownloadWorkerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.download_poll_interval(),
            batch_size: config.download_batch_size,
            max_attempts: config.download_max_attempts,
            download_timeout: config.download_timeout(),
            credential: config.download_credential.clone(),
        }
    }
}

#[derive(Debug)]
pub enum DownloadOutcome {
    Completed {
        /// Detached voucher job, spawned when this was the instance's last
        /// pending attachment.
        voucher: Option<JoinHandle<()>>,
    },
    Failed {
        reason: String,
    },
}

impl DownloadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadOutcome::Completed { .. })
    }
}

pub struct DownloadWorker {
    attachments: Arc<dyn AttachmentStore>,
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn Storage>,
    vouchers: Option<Arc<dyn VoucherGenerator>>,
    config: DownloadWorkerConfig,
}

impl DownloadWorker {
    pub fn new(
        attachments: Arc<dyn AttachmentStore>,
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn Storage>,
        config: DownloadWorkerConfig,
    ) -> Self {
        Self {
            attachments,
            fetcher,
            storage,
            vouchers: None,
            config,
        }
    }

    pub fn with_voucher_generator(mut self, vouchers: Arc<dyn VoucherGenerator>) -> Self {
        self.vouchers = Some(vouchers);
        self
    }

    pub fn config(&self) -> &DownloadWorkerConfig {
        &self.config
    }

    /// Operator action: return an instance's `FAILED` attachments to
    /// `PENDING` so the next cycle picks them up.
    pub async fn requeue_failed(&self, instance_id: &str) -> Result<u64> {
        let requeued = self
            .attachments
            .requeue_failed(instance_id)
            .await
            .with_context(|| format!("Failed to requeue attachments of {}", instance_id))?;
        tracing::info!(instance_id = %instance_id, count = requeued, "Requeued failed attachments");
        Ok(requeued)
    }

    pub async fn process_batch(&self) -> Result<CycleReport> {
        let batch = self
            .attachments
            .get_pending(self.config.batch_size)
            .await
            .context("Failed to fetch pending attachments")?;

        let mut report = CycleReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        tracing::debug!(count = batch.len(), "Downloading attachments");

        for attachment in &batch {
            match self.process_attachment(attachment).await {
                Ok(outcome) => report.record(outcome.is_completed()),
                Err(e) => {
                    tracing::error!(
                        attachment_id = %attachment.id,
                        instance_id = %attachment.instance_id,
                        error = %e,
                        "Failed to record download outcome"
                    );
                    report.record(false);
                }
            }
        }

        Ok(report)
    }

    /// Download one attachment. `Err` only when the status write fails.
    #[tracing::instrument(skip(self, attachment), fields(attachment_id = %attachment.id, instance_id = %attachment.instance_id))]
    pub async fn process_attachment(&self, attachment: &Attachment) -> Result<DownloadOutcome> {
        let url = match attachment.source_url.as_deref() {
            Some(url) if attachment.has_source_url() => url,
            _ => return self.fail(attachment, "missing source URL".to_string()).await,
        };

        let key = attachment_key(&attachment.instance_id, attachment.id, &attachment.file_name);
        if let Err(e) = self.storage.validate_path(&key) {
            return self.fail(attachment, format!("invalid storage path: {}", e)).await;
        }

        let fetch = self.fetcher.fetch_with_retry(
            url,
            self.config.credential.as_deref(),
            self.config.max_attempts,
        );
        let file = match timeout(self.config.download_timeout, fetch).await {
            Ok(Ok(file)) => file,
            Ok(Err(e)) => {
                return self
                    .fail(attachment, format!("download failed [{}]: {}", e.class(), e))
                    .await
            }
            Err(_) => {
                let reason = format!(
                    "download failed [temporary]: timed out after {}s",
                    self.config.download_timeout.as_secs()
                );
                return self.fail(attachment, reason).await;
            }
        };

        let size = file.size as i64;
        let file_path = match self.storage.save(&key, file.bytes).await {
            Ok(path) => path,
            Err(e) => return self.fail(attachment, format!("failed to save file: {}", e)).await,
        };

        let mime_type = file.content_type.as_deref().or(attachment.mime_type.as_deref());
        self.attachments
            .mark_download_completed(attachment.id, &file_path, size, mime_type)
            .await?;

        tracing::info!(size_bytes = size, path = %file_path, "Attachment downloaded");

        let voucher = self.maybe_generate_voucher(&attachment.instance_id).await;
        Ok(DownloadOutcome::Completed { voucher })
    }

    async fn fail(&self, attachment: &Attachment, reason: String) -> Result<DownloadOutcome> {
        tracing::warn!(reason = %reason, "Attachment download failed");
        self.attachments
            .update_status(attachment.id, AttachmentStatus::Failed, Some(&reason))
            .await?;
        Ok(DownloadOutcome::Failed { reason })
    }

    async fn maybe_generate_voucher(&self, instance_id: &str) -> Option<JoinHandle<()>> {
        let vouchers = self.vouchers.clone()?;

        let pending = match self.attachments.get_by_instance_id(instance_id).await {
            Ok(attachments) => attachments
                .iter()
                .filter(|a| a.status == AttachmentStatus::Pending)
                .count(),
            Err(e) => {
                tracing::warn!(instance_id = %instance_id, error = %e, "Skipping voucher check");
                return None;
            }
        };
        if pending > 0 {
            return None;
        }

        let instance_id = instance_id.to_string();
        Some(tokio::spawn(async move {
            match vouchers.generate_package(&instance_id).await {
                Ok(()) => tracing::info!(instance_id = %instance_id, "Voucher package generated"),
                Err(e) => tracing::error!(
                    instance_id = %instance_id,
                    error = %e,
                    "Voucher package generation failed"
                ),
            }
        }))
    }
}

#[async_trait]
impl PollTask for DownloadWorker {
    fn name(&self) -> &'static str {
        "download_worker"
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        self.process_batch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use expense_storage::LocalStorage;

    struct Fixture {
        stores: MockStores,
        fetcher: Arc<MockFetcher>,
        vouchers: Arc<MockVoucherGenerator>,
        worker: DownloadWorker,
        _dir: tempfile::TempDir,
    }

    async fn fixture(fetcher: MockFetcher) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
        let stores = MockStores::new();
        let fetcher = Arc::new(fetcher);
        let vouchers = Arc::new(MockVoucherGenerator::new());
        let worker = DownloadWorker::new(
            stores.attachments.clone(),
            fetcher.clone(),
            storage,
            DownloadWorkerConfig::default(),
        )
        .with_voucher_generator(vouchers.clone());
        Fixture {
            stores,
            fetcher,
            vouchers,
            worker,
            _dir: dir,
        }
    }

    fn pending(instance_id: &str) -> Attachment {
        make_attachment(instance_id, AttachmentStatus::Pending)
    }

    #[tokio::test]
    async fn downloads_and_marks_completed() {
        let f = fixture(MockFetcher::serving(b"%PDF-1.4", Some("application/pdf"))).await;
        let attachment = pending("inst-1");
        f.stores.attachments.insert(attachment.clone());

        let outcome = f.worker.process_attachment(&attachment).await.unwrap();

        let DownloadOutcome::Completed { voucher } = outcome else {
            panic!("expected completed download");
        };
        voucher.expect("last pending attachment triggers voucher").await.unwrap();
        assert_eq!(f.vouchers.generated(), vec!["inst-1"]);

        let stored = f.stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::Completed);
        assert_eq!(stored.file_size, Some(8));
        assert_eq!(stored.mime_type.as_deref(), Some("application/pdf"));
        let path = stored.file_path.unwrap();
        assert!(path.contains("attachments/inst-1/"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn missing_url_fails_without_network() {
        let f = fixture(MockFetcher::serving(b"x", None)).await;
        let mut attachment = pending("inst-1");
        attachment.source_url = Some("   ".to_string());
        f.stores.attachments.insert(attachment.clone());

        let outcome = f.worker.process_attachment(&attachment).await.unwrap();

        assert!(matches!(outcome, DownloadOutcome::Failed { ref reason } if reason == "missing source URL"));
        assert_eq!(f.fetcher.calls(), 0);
        let stored = f.stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("missing source URL"));
    }

    fn mock_storage_worker(
        stores: &MockStores,
        fetcher: Arc<MockFetcher>,
        storage: Arc<MockStorage>,
    ) -> DownloadWorker {
        DownloadWorker::new(
            stores.attachments.clone(),
            fetcher,
            storage,
            DownloadWorkerConfig::default(),
        )
    }

    #[tokio::test]
    async fn rejected_storage_path_fails_without_network() {
        let stores = MockStores::new();
        let fetcher = Arc::new(MockFetcher::serving(b"x", None));
        let storage = Arc::new(MockStorage::new());
        storage.set_reject_keys(true);
        let worker = mock_storage_worker(&stores, fetcher.clone(), storage);
        let attachment = pending("inst-1");
        stores.attachments.insert(attachment.clone());

        let outcome = worker.process_attachment(&attachment).await.unwrap();

        assert!(matches!(outcome, DownloadOutcome::Failed { ref reason } if reason.starts_with("invalid storage path")));
        assert_eq!(fetcher.calls(), 0);
        let stored = stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::Failed);
        assert!(stored
            .error_message
            .unwrap()
            .starts_with("invalid storage path"));
    }

    #[tokio::test]
    async fn storage_write_failure_marks_failed() {
        let stores = MockStores::new();
        let fetcher = Arc::new(MockFetcher::serving(b"%PDF", None));
        let storage = Arc::new(MockStorage::new());
        storage.set_fail_writes(true);
        let worker = mock_storage_worker(&stores, fetcher.clone(), storage.clone());
        let attachment = pending("inst-1");
        stores.attachments.insert(attachment.clone());

        let outcome = worker.process_attachment(&attachment).await.unwrap();

        assert!(!outcome.is_completed());
        assert_eq!(fetcher.calls(), 1);
        assert!(storage.keys().is_empty());
        let stored = stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::Failed);
        assert!(stored.file_path.is_none());
        assert!(stored
            .error_message
            .unwrap()
            .starts_with("failed to save file"));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_completes() {
        let f = fixture(MockFetcher::serving(b"data", None).fail_on_attempts(&[1])).await;
        let attachment = pending("inst-1");
        f.stores.attachments.insert(attachment.clone());

        let outcome = f.worker.process_attachment(&attachment).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(f.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_records_class() {
        let f = fixture(MockFetcher::status(404)).await;
        let attachment = pending("inst-1");
        f.stores.attachments.insert(attachment.clone());

        f.worker.process_attachment(&attachment).await.unwrap();

        let stored = f.stores.attachments.get(attachment.id).unwrap();
        assert_eq!(stored.status, AttachmentStatus::Failed);
        assert!(stored
            .error_message
            .unwrap()
            .starts_with("download failed [permanent]"));
        assert_eq!(f.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_transient_failure_records_temporary_class() {
        let f = fixture(MockFetcher::status(503)).await;
        let attachment = pending("inst-1");
        f.stores.attachments.insert(attachment.clone());

        f.worker.process_attachment(&attachment).await.unwrap();

        let stored = f.stores.attachments.get(attachment.id).unwrap();
        assert!(stored
            .error_message
            .unwrap()
            .starts_with("download failed [temporary]"));
        assert_eq!(f.fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn voucher_waits_for_remaining_pending_attachments() {
        let f = fixture(MockFetcher::serving(b"data", None)).await;
        let first = pending("inst-1");
        let second = pending("inst-1");
        f.stores.attachments.insert(first.clone());
        f.stores.attachments.insert(second.clone());

        let DownloadOutcome::Completed { voucher } =
            f.worker.process_attachment(&first).await.unwrap()
        else {
            panic!("expected completed download");
        };
        assert!(voucher.is_none());

        let DownloadOutcome::Completed { voucher } =
            f.worker.process_attachment(&second).await.unwrap()
        else {
            panic!("expected completed download");
        };
        voucher.unwrap().await.unwrap();
        assert_eq!(f.vouchers.generated(), vec!["inst-1"]);
    }

    #[tokio::test]
    async fn voucher_failure_is_contained() {
        let f = fixture(MockFetcher::serving(b"data", None)).await;
        f.vouchers.set_fail(true);
        let attachment = pending("inst-1");
        f.stores.attachments.insert(attachment.clone());

        let DownloadOutcome::Completed { voucher } =
            f.worker.process_attachment(&attachment).await.unwrap()
        else {
            panic!("expected completed download");
        };
        voucher.unwrap().await.unwrap();
        assert_eq!(
            f.stores.attachments.get(attachment.id).unwrap().status,
            AttachmentStatus::Completed
        );
    }

    #[tokio::test]
    async fn batch_and_requeue() {
        let f = fixture(MockFetcher::status(404)).await;
        f.stores.attachments.insert(pending("inst-1"));
        f.stores.attachments.insert(pending("inst-1"));

        let report = f.worker.process_batch().await.unwrap();
        assert_eq!(report, CycleReport { processed: 0, failed: 2 });

        let requeued = f.worker.requeue_failed("inst-1").await.unwrap();
        assert_eq!(requeued, 2);
        assert_eq!(
            f.stores
                .attachments
                .count_with_status("inst-1", AttachmentStatus::Pending),
            2
        );
    }
}
