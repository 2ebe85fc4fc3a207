//! Fallback instance-status reconciliation
//!
//! When push events from the approval platform cannot reach the process,
//! this poller asks the platform for the status of every non-terminal
//! instance and feeds differences into the workflow engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use expense_core::models::InstanceStatus;
use expense_core::{
    ApprovalPlatform, EventOrigin, InstanceEvent, InstanceEventHandler, PipelineConfig,
};
use expense_db::InstanceStore;

use crate::worker::{CycleReport, PollTask};

#[derive(Debug, Clone)]
pub struct StatusPollerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Bound on each `get_instance_status` call.
    pub request_timeout: Duration,
}

impl Default for StatusPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 50,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&PipelineConfig> for StatusPollerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.status_poll_interval(),
            batch_size: config.status_poll_batch_size,
            ..Default::default()
        }
    }
}

pub struct StatusPoller {
    instances: Arc<dyn InstanceStore>,
    platform: Arc<dyn ApprovalPlatform>,
    handler: Arc<dyn InstanceEventHandler>,
    config: StatusPollerConfig,
}

impl StatusPoller {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        platform: Arc<dyn ApprovalPlatform>,
        handler: Arc<dyn InstanceEventHandler>,
        config: StatusPollerConfig,
    ) -> Self {
        Self {
            instances,
            platform,
            handler,
            config,
        }
    }

    pub fn config(&self) -> &StatusPollerConfig {
        &self.config
    }

    /// One reconciliation pass. Per-instance errors are logged and counted,
    /// never abort the pass.
    pub async fn poll_once(&self) -> Result<CycleReport> {
        let instances = self
            .instances
            .list_non_terminal(self.config.batch_size)
            .await
            .context("Failed to list non-terminal instances")?;

        let mut report = CycleReport::default();
        for instance in instances.iter().filter(|i| !i.status.is_terminal()) {
            match self.reconcile(&instance.instance_id, instance.status).await {
                Ok(changed) => {
                    if changed {
                        report.record(true);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "Status reconciliation failed"
                    );
                    report.record(false);
                }
            }
        }

        Ok(report)
    }

    async fn reconcile(&self, instance_id: &str, local: InstanceStatus) -> Result<bool> {
        let remote = timeout(
            self.config.request_timeout,
            self.platform.get_instance_status(instance_id),
        )
        .await
        .map_err(|_| anyhow::anyhow!("status request timed out"))?
        .context("Failed to fetch instance status")?;

        if remote == local {
            return Ok(false);
        }

        tracing::info!(
            instance_id = %instance_id,
            from = %local,
            to = %remote,
            "Instance status changed upstream"
        );
        self.handler
            .handle_status_change(InstanceEvent::status_change(instance_id, remote, EventOrigin::Poll))
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl PollTask for StatusPoller {
    fn name(&self) -> &'static str {
        "status_poller"
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        self.poll_once().await
    }
}

/// Default workflow engine: persist the new status, stamping the approval
/// time on `APPROVED`.
pub struct StatusSyncHandler {
    instances: Arc<dyn InstanceStore>,
}

impl StatusSyncHandler {
    pub fn new(instances: Arc<dyn InstanceStore>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl InstanceEventHandler for StatusSyncHandler {
    async fn handle_status_change(&self, event: InstanceEvent) -> Result<()> {
        let approved_at = (event.status == InstanceStatus::Approved).then(Utc::now);
        self.instances
            .update_status(&event.instance_id, event.status, approved_at)
            .await
            .with_context(|| format!("Failed to update status of {}", event.instance_id))?;

        tracing::info!(
            instance_id = %event.instance_id,
            status = %event.status,
            origin = %event.origin,
            "Instance status updated"
        );
        Ok(())
    }
}
