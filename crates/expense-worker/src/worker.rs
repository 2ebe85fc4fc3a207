//! Worker lifecycle
//!
//! A [`PollTask`] is one unit of periodic work (drain a batch, reconcile a
//! page of instances). [`PollingWorker`] runs it on a fixed interval until
//! cancelled and keeps a status snapshot for operators.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Operator-facing snapshot of one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub is_running: bool,
    pub cycles: u64,
    pub processed: u64,
    pub failed: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Items handled by a single cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub processed: u64,
    pub failed: u64,
}

impl CycleReport {
    pub fn record(&mut self, ok: bool) {
        if ok {
            self.processed += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[async_trait]
pub trait PollTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs once before the first cycle; an error aborts `start`.
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn run_cycle(&self) -> Result<CycleReport>;
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawn the loop under a child of `shutdown`. Errors if already running.
    async fn start(&self, shutdown: &CancellationToken) -> Result<()>;

    /// Cancel the loop and wait for it to exit.
    async fn stop(&self);

    fn status(&self) -> WorkerStatus;
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PollingWorker<T: PollTask> {
    task: Arc<T>,
    interval: Duration,
    grace: Duration,
    status: Arc<Mutex<WorkerStatus>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

fn lock(status: &Mutex<WorkerStatus>) -> MutexGuard<'_, WorkerStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: PollTask> PollingWorker<T> {
    pub fn new(task: T, interval: Duration) -> Self {
        Self::from_arc(Arc::new(task), interval)
    }

    pub fn from_arc(task: Arc<T>, interval: Duration) -> Self {
        let status = WorkerStatus {
            name: task.name().to_string(),
            ..Default::default()
        };
        Self {
            task,
            interval,
            grace: Duration::from_secs(30),
            status: Arc::new(Mutex::new(status)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Upper bound on how long `stop` waits for an in-flight cycle.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    async fn run_loop(
        task: Arc<T>,
        interval: Duration,
        status: Arc<Mutex<WorkerStatus>>,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            worker = task.name(),
            interval_ms = interval.as_millis() as u64,
            "Worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let result = task.run_cycle().await;
                    let mut s = lock(&status);
                    s.cycles += 1;
                    match result {
                        Ok(report) => {
                            s.processed += report.processed;
                            s.failed += report.failed;
                            if report.processed + report.failed > 0 {
                                s.last_processed_at = Some(Utc::now());
                                tracing::debug!(
                                    worker = task.name(),
                                    processed = report.processed,
                                    failed = report.failed,
                                    "Cycle finished"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(worker = task.name(), error = %e, "Cycle failed");
                            s.last_error = Some(format!("{:#}", e));
                        }
                    }
                }
            }
        }

        lock(&status).is_running = false;
        tracing::info!(worker = task.name(), "Worker stopped");
    }
}

#[async_trait]
impl<T: PollTask> Worker for PollingWorker<T> {
    fn name(&self) -> &'static str {
        self.task.name()
    }

    async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                anyhow::bail!("worker {} is already running", self.task.name());
            }
        }

        self.task.on_start().await?;

        let token = shutdown.child_token();
        lock(&self.status).is_running = true;

        let handle = tokio::spawn(Self::run_loop(
            self.task.clone(),
            self.interval,
            self.status.clone(),
            token.clone(),
        ));

        *running = Some(Running { token, handle });
        Ok(())
    }

    async fn stop(&self) {
        let Some(Running { token, mut handle }) = self.running.lock().await.take() else {
            return;
        };

        token.cancel();
        if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
            tracing::warn!(
                worker = self.task.name(),
                grace_ms = self.grace.as_millis() as u64,
                "Worker did not stop within grace period, aborting"
            );
            handle.abort();
        }
        lock(&self.status).is_running = false;
    }

    fn status(&self) -> WorkerStatus {
        lock(&self.status).clone()
    }
}
