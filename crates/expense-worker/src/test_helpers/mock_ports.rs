//! Doubles for the collaborator ports: extraction, audit checks, the approval
//! platform, voucher generation, the workflow engine and the fetcher.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use expense_core::models::{
    AuditNotice, InstanceStatus, InvoiceData, PolicyCheckResult, PriceCheckResult,
};
use expense_core::{
    ApprovalPlatform, Approver, AuditService, InstanceEvent, InstanceEventHandler,
    InvoiceExtractor, VoucherGenerator,
};
use expense_infra::{retry_async, FetchError, FetchedFile, Fetcher, RetryStrategy};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Extractor keyed by stored file path. Unknown paths fail extraction.
#[derive(Clone, Default)]
pub struct MockExtractor {
    invoices: Arc<Mutex<HashMap<String, InvoiceData>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<AtomicU32>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, file_path: &str, invoice: InvoiceData) {
        self.invoices
            .lock()
            .unwrap()
            .insert(file_path.to_string(), invoice);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoiceExtractor for MockExtractor {
    async fn extract(&self, file_path: &str) -> Result<InvoiceData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.invoices
            .lock()
            .unwrap()
            .get(file_path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unreadable document: {}", file_path))
    }
}

/// Audit checks with configurable results, failures and delays.
#[derive(Clone)]
pub struct MockAuditService {
    policy: Arc<Mutex<std::result::Result<PolicyCheckResult, String>>>,
    price: Arc<Mutex<std::result::Result<PriceCheckResult, String>>>,
    price_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockAuditService {
    /// Compliant policy and reasonable price, both at 0.9 confidence.
    pub fn passing() -> Self {
        Self {
            policy: Arc::new(Mutex::new(Ok(PolicyCheckResult {
                compliant: true,
                violations: Vec::new(),
                confidence: 0.9,
                degraded: false,
            }))),
            price: Arc::new(Mutex::new(Ok(PriceCheckResult {
                reasonable: true,
                confidence: 0.9,
                reference_amount: None,
                reason: None,
            }))),
            price_delay: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_policy(&self, result: PolicyCheckResult) {
        *self.policy.lock().unwrap() = Ok(result);
    }

    pub fn set_price(&self, result: PriceCheckResult) {
        *self.price.lock().unwrap() = Ok(result);
    }

    pub fn fail_policy(&self, message: &str) {
        *self.policy.lock().unwrap() = Err(message.to_string());
    }

    pub fn fail_price(&self, message: &str) {
        *self.price.lock().unwrap() = Err(message.to_string());
    }

    pub fn set_price_delay(&self, delay: Duration) {
        *self.price_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl AuditService for MockAuditService {
    async fn check_policy(&self, _data: &InvoiceData, _category: &str) -> Result<PolicyCheckResult> {
        let result = self.policy.lock().unwrap().clone();
        result.map_err(anyhow::Error::msg)
    }

    async fn check_price(&self, _data: &InvoiceData, _claimed_amount: f64) -> Result<PriceCheckResult> {
        let delay = *self.price_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.price.lock().unwrap().clone();
        result.map_err(anyhow::Error::msg)
    }
}

/// Approval platform recording every delivered notice.
#[derive(Clone, Default)]
pub struct MockApprovalPlatform {
    statuses: Arc<Mutex<HashMap<String, InstanceStatus>>>,
    approvers: Arc<Mutex<HashMap<String, Vec<Approver>>>>,
    failing_recipients: Arc<Mutex<HashSet<String>>>,
    fail_approver_lookup: Arc<AtomicBool>,
    send_delay: Arc<Mutex<Option<Duration>>>,
    sent: Arc<Mutex<Vec<(Approver, AuditNotice)>>>,
    status_calls: Arc<AtomicU32>,
}

impl MockApprovalPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), status);
    }

    pub fn set_approvers(&self, instance_id: &str, approvers: Vec<Approver>) {
        self.approvers
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), approvers);
    }

    pub fn fail_approver_lookup(&self, fail: bool) {
        self.fail_approver_lookup.store(fail, Ordering::SeqCst);
    }

    pub fn fail_recipient(&self, user_id: &str) {
        self.failing_recipients
            .lock()
            .unwrap()
            .insert(user_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_recipients.lock().unwrap().clear();
        self.fail_approver_lookup.store(false, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn sent(&self) -> Vec<(Approver, AuditNotice)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalPlatform for MockApprovalPlatform {
    async fn get_instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .get(instance_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("instance {} not found on platform", instance_id))
    }

    async fn get_approvers(&self, instance_id: &str) -> Result<Vec<Approver>> {
        if self.fail_approver_lookup.load(Ordering::SeqCst) {
            anyhow::bail!("approver lookup unavailable");
        }
        Ok(self
            .approvers
            .lock()
            .unwrap()
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_notification(&self, recipient: &Approver, notice: &AuditNotice) -> Result<()> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .failing_recipients
            .lock()
            .unwrap()
            .contains(&recipient.user_id)
        {
            anyhow::bail!("delivery to {} rejected", recipient.user_id);
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.clone(), notice.clone()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockVoucherGenerator {
    generated: Arc<Mutex<Vec<String>>>,
    fail: Arc<AtomicBool>,
}

impl MockVoucherGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn generated(&self) -> Vec<String> {
        self.generated.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoucherGenerator for MockVoucherGenerator {
    async fn generate_package(&self, instance_id: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("voucher template missing");
        }
        self.generated.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

/// Workflow engine double recording every event.
#[derive(Clone, Default)]
pub struct MockEventHandler {
    events: Arc<Mutex<Vec<InstanceEvent>>>,
}

impl MockEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InstanceEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceEventHandler for MockEventHandler {
    async fn handle_status_change(&self, event: InstanceEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Fetcher double driven by the real retry loop.
///
/// Attempt numbers listed in `fail_on_attempts` fail with a temporary
/// transport error; a configured status code fails every attempt.
pub struct MockFetcher {
    body: Bytes,
    content_type: Option<String>,
    status: Option<u16>,
    fail_on: HashSet<u32>,
    strategy: RetryStrategy,
    calls: AtomicU32,
}

impl MockFetcher {
    pub fn serving(body: &[u8], content_type: Option<&str>) -> Self {
        Self {
            body: Bytes::copy_from_slice(body),
            content_type: content_type.map(str::to_string),
            status: None,
            fail_on: HashSet::new(),
            strategy: RetryStrategy::new(Duration::from_millis(1), Duration::from_millis(5))
                .with_jitter(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn status(code: u16) -> Self {
        Self {
            status: Some(code),
            ..Self::serving(b"", None)
        }
    }

    pub fn fail_on_attempts(mut self, attempts: &[u32]) -> Self {
        self.fail_on = attempts.iter().copied().collect();
        self
    }

    /// Underlying single-shot calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn fetch_once(&self) -> std::result::Result<FetchedFile, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(code) = self.status {
            return Err(FetchError::Status { code });
        }
        if self.fail_on.contains(&call) {
            return Err(FetchError::Transport {
                message: "connection reset by peer".to_string(),
                temporary: true,
            });
        }
        Ok(FetchedFile {
            bytes: self.body.clone(),
            content_type: self.content_type.clone(),
            size: self.body.len() as u64,
        })
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch_with_retry(
        &self,
        url: &str,
        _credential: Option<&str>,
        max_attempts: u32,
    ) -> std::result::Result<FetchedFile, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::MissingUrl);
        }
        retry_async(
            &self.strategy,
            max_attempts,
            |e: &FetchError| e.is_temporary(),
            |_| self.fetch_once(),
        )
        .await
        .map_err(|exhausted| {
            if exhausted.attempts == 1 {
                return exhausted.last_error;
            }
            FetchError::Exhausted {
                attempts: exhausted.attempts,
                temporary: exhausted.last_error.is_temporary(),
                last: exhausted.last_error.to_string(),
            }
        })
    }
}
