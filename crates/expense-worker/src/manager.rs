use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::worker::{Worker, WorkerStatus};

/// Starts registered workers in order and stops them in reverse order.
pub struct WorkerManager {
    workers: Vec<Arc<dyn Worker>>,
    shutdown: CancellationToken,
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        tracing::debug!(worker = worker.name(), "Worker registered");
        self.workers.push(worker);
    }

    pub fn worker_names(&self) -> Vec<&'static str> {
        self.workers.iter().map(|w| w.name()).collect()
    }

    /// Parent token of every worker loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start in registration order. On the first failure the workers started
    /// so far are stopped again and the error is returned.
    pub async fn start_all(&self) -> Result<()> {
        for (index, worker) in self.workers.iter().enumerate() {
            if let Err(e) = worker.start(&self.shutdown).await {
                tracing::error!(worker = worker.name(), error = %e, "Worker failed to start");
                for started in self.workers[..index].iter().rev() {
                    started.stop().await;
                }
                return Err(e).with_context(|| format!("Failed to start worker {}", worker.name()));
            }
        }

        tracing::info!(workers = ?self.worker_names(), "All workers started");
        Ok(())
    }

    /// Stop every worker in reverse registration order.
    pub async fn stop_all(&self) {
        for worker in self.workers.iter().rev() {
            worker.stop().await;
        }
        tracing::info!("All workers stopped");
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(|w| w.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        fail_start: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Worker for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self, _shutdown: &CancellationToken) -> Result<()> {
            if self.fail_start {
                anyhow::bail!("boom");
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }

        fn status(&self) -> WorkerStatus {
            WorkerStatus {
                name: self.name.to_string(),
                ..Default::default()
            }
        }
    }

    fn manager(names: &[(&'static str, bool)]) -> (WorkerManager, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = WorkerManager::new();
        for (name, fail_start) in names {
            manager.register(Arc::new(Recorder {
                name: *name,
                fail_start: *fail_start,
                log: log.clone(),
            }));
        }
        (manager, log)
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let (manager, log) = manager(&[("download", false), ("audit", false), ("status", false)]);

        manager.start_all().await.unwrap();
        manager.stop_all().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start download",
                "start audit",
                "start status",
                "stop status",
                "stop audit",
                "stop download",
            ]
        );
        assert_eq!(manager.statuses().len(), 3);
    }

    #[tokio::test]
    async fn start_all_fails_fast() {
        let (manager, log) = manager(&[("download", false), ("audit", true), ("status", false)]);

        let err = manager.start_all().await.unwrap_err();
        assert!(format!("{:#}", err).contains("audit"));
        assert_eq!(*log.lock().unwrap(), vec!["start download", "stop download"]);
    }
}
