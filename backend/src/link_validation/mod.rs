//! Validation and repair of stored preview links
//!
//! Preview links are presigned and expire, so a listing checks every row it
//! returns. Checks run on a fixed pool of workers; a dead link is replaced by
//! a freshly issued one from the asset store when possible.

mod error;
mod liveness;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use error::{LivenessError, LivenessResult, ValidationError};
pub use liveness::{HttpLivenessChecker, LivenessChecker};

use crate::asset_storage::AssetStore;

/// Validation pool tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    pub num_workers: usize,
    pub queue_capacity: usize,
    /// Upper bound on one liveness check
    pub check_timeout: Duration,
    /// Upper bound on issuing a replacement link
    pub repair_timeout: Duration,
}

impl ValidationConfig {
    /// Config for `num_workers` workers with a queue twice that size
    #[must_use]
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            queue_capacity: num_workers * 2,
            check_timeout: Duration::from_secs(5),
            repair_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self::with_workers(5)
    }
}

/// A link to check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationTask {
    /// Position of the row in the listing
    pub sequence_index: usize,
    pub asset_id: String,
    pub preview_link: String,
}

/// Outcome of checking one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub sequence_index: usize,
    pub asset_id: String,
    /// Whether the stored link is reachable
    pub is_valid: bool,
    /// Replacement link, only set when the stored one is dead
    pub repaired_link: Option<String>,
}

struct QueuedCheck {
    task: ValidationTask,
    results: flume::Sender<ValidationResult>,
}

/// Fixed-size pool of link validation workers
pub struct LinkValidationPool {
    sender: Mutex<Option<flume::Sender<QueuedCheck>>>,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkValidationPool {
    /// Spawns the workers and returns the running pool
    #[must_use]
    pub fn start(
        checker: Arc<dyn LivenessChecker>,
        asset_store: Arc<dyn AssetStore>,
        config: ValidationConfig,
    ) -> Self {
        let (sender, receiver) = flume::bounded::<QueuedCheck>(config.queue_capacity.max(1));
        let shutdown_token = CancellationToken::new();
        let config = Arc::new(config);

        info!(
            workers = config.num_workers,
            queue_capacity = config.queue_capacity,
            "Starting link validation pool"
        );

        let workers = (0..config.num_workers.max(1))
            .map(|worker_id| {
                let worker = ValidationWorker {
                    worker_id,
                    checker: Arc::clone(&checker),
                    asset_store: Arc::clone(&asset_store),
                    config: Arc::clone(&config),
                };
                let receiver = receiver.clone();
                let shutdown_token = shutdown_token.clone();

                tokio::spawn(async move {
                    worker.run(receiver, shutdown_token).await;
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            shutdown_token,
            workers: Mutex::new(workers),
        }
    }

    /// Checks every link and returns the results ordered by `sequence_index`
    ///
    /// Results travel on a channel private to this call with room for every
    /// task, so concurrent callers never see each other's results and a
    /// worker never waits on a caller to read.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::PoolClosed` if the pool has been shut down and
    /// `ValidationError::Incomplete` if workers stopped before answering all tasks
    pub async fn validate(
        &self,
        tasks: Vec<ValidationTask>,
    ) -> Result<Vec<ValidationResult>, ValidationError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ValidationError::PoolClosed)?;

        let expected = tasks.len();
        let (results_tx, results_rx) = flume::bounded(expected);

        for task in tasks {
            let queued = QueuedCheck {
                task,
                results: results_tx.clone(),
            };
            sender
                .send_async(queued)
                .await
                .map_err(|_| ValidationError::PoolClosed)?;
        }
        drop(results_tx);

        let mut results = Vec::with_capacity(expected);
        while results.len() < expected {
            match results_rx.recv_async().await {
                Ok(result) => results.push(result),
                Err(flume::RecvError::Disconnected) => {
                    return Err(ValidationError::Incomplete {
                        expected,
                        received: results.len(),
                    })
                }
            }
        }

        results.sort_by_key(|result| result.sequence_index);
        Ok(results)
    }

    /// Stops accepting tasks and waits for the workers to finish queued checks
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown_token.cancel();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Validation worker task error: {}", e);
            }
        }

        info!("Link validation pool stopped");
    }
}

struct ValidationWorker {
    worker_id: usize,
    checker: Arc<dyn LivenessChecker>,
    asset_store: Arc<dyn AssetStore>,
    config: Arc<ValidationConfig>,
}

impl ValidationWorker {
    async fn run(&self, receiver: flume::Receiver<QueuedCheck>, shutdown_token: CancellationToken) {
        debug!("Validation worker {} started", self.worker_id);

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => {
                    while let Ok(queued) = receiver.try_recv() {
                        self.handle(queued).await;
                    }
                    break;
                }
                result = receiver.recv_async() => {
                    match result {
                        Ok(queued) => self.handle(queued).await,
                        Err(flume::RecvError::Disconnected) => break,
                    }
                }
            }
        }

        debug!("Validation worker {} stopped", self.worker_id);
    }

    async fn handle(&self, queued: QueuedCheck) {
        let QueuedCheck { task, results } = queued;
        let result = self.validate(task).await;

        // Capacity matches the caller's task count, so this never waits
        if results.send_async(result).await.is_err() {
            debug!(worker_id = self.worker_id, "Validation caller went away");
        }
    }

    async fn validate(&self, task: ValidationTask) -> ValidationResult {
        let ValidationTask {
            sequence_index,
            asset_id,
            preview_link,
        } = task;

        if self.is_alive(&asset_id, &preview_link).await {
            return ValidationResult {
                sequence_index,
                asset_id,
                is_valid: true,
                repaired_link: None,
            };
        }

        let repaired_link = self.repair(&asset_id).await;
        ValidationResult {
            sequence_index,
            asset_id,
            is_valid: false,
            repaired_link,
        }
    }

    async fn is_alive(&self, asset_id: &str, link: &str) -> bool {
        if link.is_empty() {
            return false;
        }

        match self.checker.check(link, self.config.check_timeout).await {
            Ok(alive) => alive,
            Err(e) => {
                debug!(asset_id, error = %e, "Preview link unreachable");
                false
            }
        }
    }

    async fn repair(&self, asset_id: &str) -> Option<String> {
        match tokio::time::timeout(
            self.config.repair_timeout,
            self.asset_store.refresh_link(asset_id),
        )
        .await
        {
            Ok(Ok(link)) => {
                debug!(asset_id, "Issued replacement preview link");
                Some(link)
            }
            Ok(Err(e)) => {
                warn!(asset_id, error = %e, "Failed to repair preview link");
                None
            }
            Err(_) => {
                warn!(
                    asset_id,
                    timeout = ?self.config.repair_timeout,
                    "Timed out repairing preview link"
                );
                None
            }
        }
    }
}
