//! Pipeline assembly: wire stores and ports into the polling workers.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;

use expense_core::{
    ApprovalPlatform, AuditService, InstanceEventHandler, InvoiceExtractor, PipelineConfig,
    VoucherGenerator,
};
use expense_db::{
    AttachmentStore, InstanceStore, InvoiceIndex, NotificationStore, PgAttachmentRepository,
    PgInstanceRepository, PgInvoiceIndexRepository, PgNotificationRepository,
};
use expense_infra::{Fetcher, HttpFetcher, RetryStrategy};
use expense_storage::Storage;

use crate::audit::{AuditProcessor, AuditProcessorConfig};
use crate::download::{DownloadWorker, DownloadWorkerConfig};
use crate::manager::WorkerManager;
use crate::notifier::Notifier;
use crate::status_poller::{StatusPoller, StatusPollerConfig, StatusSyncHandler};
use crate::worker::PollingWorker;

#[derive(Clone)]
pub struct Stores {
    pub attachments: Arc<dyn AttachmentStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub notifications: Arc<dyn NotificationStore>,
    /// Duplicate detection is skipped when absent.
    pub invoice_index: Option<Arc<dyn InvoiceIndex>>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            attachments: Arc::new(PgAttachmentRepository::new(pool.clone())),
            instances: Arc::new(PgInstanceRepository::new(pool.clone())),
            notifications: Arc::new(PgNotificationRepository::new(pool.clone())),
            invoice_index: Some(Arc::new(PgInvoiceIndexRepository::new(pool))),
        }
    }
}

pub struct PipelinePorts {
    pub stores: Stores,
    pub storage: Arc<dyn Storage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn InvoiceExtractor>,
    pub auditor: Arc<dyn AuditService>,
    pub platform: Arc<dyn ApprovalPlatform>,
    pub vouchers: Option<Arc<dyn VoucherGenerator>>,
    /// Defaults to [`StatusSyncHandler`] over the instance store.
    pub event_handler: Option<Arc<dyn InstanceEventHandler>>,
}

/// Reqwest-backed fetcher using the configured retry policy and download
/// timeout as the per-request bound.
pub fn http_fetcher(config: &PipelineConfig) -> Result<Arc<dyn Fetcher>> {
    let fetcher = HttpFetcher::new(RetryStrategy::from_config(config), config.download_timeout())?;
    Ok(Arc::new(fetcher))
}

/// Register the download worker, the audit processor (notifying on every
/// terminal write) and, when enabled, the status poller, in that order.
pub fn build_worker_manager(config: &PipelineConfig, ports: PipelinePorts) -> WorkerManager {
    let PipelinePorts {
        stores,
        storage,
        fetcher,
        extractor,
        auditor,
        platform,
        vouchers,
        event_handler,
    } = ports;
    let grace = config.shutdown_grace();
    let mut manager = WorkerManager::new();

    let download_config = DownloadWorkerConfig::from(config);
    let interval = download_config.poll_interval;
    let mut download = DownloadWorker::new(stores.attachments.clone(), fetcher, storage, download_config);
    if let Some(vouchers) = vouchers {
        download = download.with_voucher_generator(vouchers);
    }
    manager.register(Arc::new(
        PollingWorker::new(download, interval).with_grace_period(grace),
    ));

    let notifier = Arc::new(Notifier::new(
        stores.attachments.clone(),
        stores.instances.clone(),
        stores.notifications.clone(),
        platform.clone(),
    ));
    let audit_config = AuditProcessorConfig::from(config);
    let interval = audit_config.poll_interval;
    let mut audit = AuditProcessor::new(
        stores.attachments.clone(),
        stores.instances.clone(),
        extractor,
        auditor,
        audit_config,
    )
    .with_notifier(notifier);
    if let Some(index) = stores.invoice_index.clone() {
        audit = audit.with_invoice_index(index);
    }
    manager.register(Arc::new(
        PollingWorker::new(audit, interval).with_grace_period(grace),
    ));

    if config.status_poll_enabled {
        let handler = event_handler
            .unwrap_or_else(|| Arc::new(StatusSyncHandler::new(stores.instances.clone())));
        let poller_config = StatusPollerConfig::from(config);
        let interval = poller_config.poll_interval;
        let poller = StatusPoller::new(stores.instances.clone(), platform, handler, poller_config);
        manager.register(Arc::new(
            PollingWorker::new(poller, interval).with_grace_period(grace),
        ));
    }

    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    fn ports(stores: &MockStores) -> PipelinePorts {
        PipelinePorts {
            stores: stores.as_stores(),
            storage: Arc::new(MockStorage::new()),
            fetcher: Arc::new(MockFetcher::serving(b"data", None)),
            extractor: Arc::new(MockExtractor::new()),
            auditor: Arc::new(MockAuditService::passing()),
            platform: Arc::new(MockApprovalPlatform::new()),
            vouchers: None,
            event_handler: None,
        }
    }

    #[test]
    fn registers_status_poller_only_when_enabled() {
        let stores = MockStores::new();

        let config = PipelineConfig::default();
        let manager = build_worker_manager(&config, ports(&stores));
        assert_eq!(manager.worker_names(), vec!["download_worker", "audit_processor"]);

        let config = PipelineConfig {
            status_poll_enabled: true,
            ..Default::default()
        };
        let manager = build_worker_manager(&config, ports(&stores));
        assert_eq!(
            manager.worker_names(),
            vec!["download_worker", "audit_processor", "status_poller"]
        );
    }

    #[test]
    fn builds_http_fetcher_from_config() {
        assert!(http_fetcher(&PipelineConfig::default()).is_ok());
    }
}
