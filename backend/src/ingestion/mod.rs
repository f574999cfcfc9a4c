//! Background ingestion of uploaded images
//!
//! Upload requests hand their files to an [`IngestionPool`] and return as soon
//! as every file is queued. A fixed set of workers drains the bounded queue:
//! each task uploads the file to the asset store, waits a bounded amount of
//! time for the preview to be generated and finally records the image row.

mod error;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gallery_storage::images::{ImageStore, NewImage};
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use error::{IngestionError, IngestionResult};

use crate::asset_storage::{AssetStore, UploadedFile};

/// Ingestion pool tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionConfig {
    /// Number of worker tasks
    pub num_workers: usize,
    /// Tasks that can wait in the queue before submitters are held back
    pub queue_capacity: usize,
    /// Asset store folder new uploads are placed in
    pub upload_folder: String,
    /// Preview lookups made before giving up on a preview
    pub preview_attempts: usize,
    /// Pause between two preview lookups
    pub preview_delay: Duration,
    /// Upper bound on a single upload call
    pub upload_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            num_workers: 25,
            queue_capacity: 100,
            upload_folder: "gallery".to_string(),
            preview_attempts: 5,
            preview_delay: Duration::from_secs(1),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

/// One file waiting to be ingested
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub file: UploadedFile,
    /// Free-form label of the uploader
    pub owner: String,
}

/// An image that made it into the durable store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedImage {
    pub asset_id: String,
    pub file_name: String,
    /// Empty when no preview was ready before the attempts ran out
    pub preview_link: String,
}

struct QueuedTask {
    task: UploadTask,
    reply: oneshot::Sender<IngestionResult<IngestedImage>>,
}

/// Outcomes of one submitted batch
///
/// Dropping the handle does not cancel anything; workers still process and
/// log every task.
#[derive(Debug)]
pub struct BatchHandle {
    outcomes: Vec<oneshot::Receiver<IngestionResult<IngestedImage>>>,
}

impl BatchHandle {
    /// Number of tasks in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Waits for every task of the batch, returning outcomes in submission order
    pub async fn wait(self) -> Vec<IngestionResult<IngestedImage>> {
        let mut results = Vec::with_capacity(self.outcomes.len());
        for outcome in self.outcomes {
            results.push(outcome.await.unwrap_or(Err(IngestionError::Abandoned)));
        }
        results
    }
}

/// Fixed-size pool of ingestion workers fed by a bounded queue
pub struct IngestionPool {
    sender: Mutex<Option<flume::Sender<QueuedTask>>>,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionPool {
    /// Spawns the workers and returns the running pool
    #[must_use]
    pub fn start(
        asset_store: Arc<dyn AssetStore>,
        image_store: Arc<dyn ImageStore>,
        config: IngestionConfig,
    ) -> Self {
        let (sender, receiver) = flume::bounded::<QueuedTask>(config.queue_capacity.max(1));
        let shutdown_token = CancellationToken::new();
        let config = Arc::new(config);

        info!(
            workers = config.num_workers,
            queue_capacity = config.queue_capacity,
            "Starting ingestion pool"
        );

        let workers = (0..config.num_workers.max(1))
            .map(|worker_id| {
                let worker = IngestionWorker {
                    worker_id,
                    asset_store: Arc::clone(&asset_store),
                    image_store: Arc::clone(&image_store),
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

    /// Queues one task per file
    ///
    /// Waits while the queue is full. The returned handle yields one outcome
    /// per file, in the order given.
    ///
    /// # Errors
    ///
    /// Returns `IngestionError::PoolClosed` if the pool has been shut down.
    /// Files queued before the pool closed are still processed.
    pub async fn submit_batch(
        &self,
        files: Vec<UploadedFile>,
        owner: &str,
    ) -> IngestionResult<BatchHandle> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(IngestionError::PoolClosed)?;

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            let (reply, outcome) = oneshot::channel();
            let queued = QueuedTask {
                task: UploadTask {
                    file,
                    owner: owner.to_string(),
                },
                reply,
            };

            sender.send_async(queued).await.map_err(|_| {
                warn!(queued = outcomes.len(), "Ingestion pool closed mid batch");
                IngestionError::PoolClosed
            })?;
            outcomes.push(outcome);
        }

        debug!(tasks = outcomes.len(), owner, "Queued upload batch");
        Ok(BatchHandle { outcomes })
    }

    /// Number of tasks waiting in the queue
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, flume::Sender::len)
    }

    /// Stops accepting tasks and waits for the workers to finish every queued task
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
                error!("Ingestion worker task error: {}", e);
            }
        }

        info!("Ingestion pool stopped");
    }
}

struct IngestionWorker {
    worker_id: usize,
    asset_store: Arc<dyn AssetStore>,
    image_store: Arc<dyn ImageStore>,
    config: Arc<IngestionConfig>,
}

impl IngestionWorker {
    async fn run(&self, receiver: flume::Receiver<QueuedTask>, shutdown_token: CancellationToken) {
        debug!("Ingestion worker {} started", self.worker_id);

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => {
                    // Tasks already accepted are still owed an outcome
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

        debug!("Ingestion worker {} stopped", self.worker_id);
    }

    async fn handle(&self, queued: QueuedTask) {
        let QueuedTask { task, reply } = queued;
        let outcome = self.ingest(task).await;

        match &outcome {
            Ok(image) => {
                counter!("images_ingested").increment(1);
                info!(
                    worker_id = self.worker_id,
                    asset_id = %image.asset_id,
                    has_preview = !image.preview_link.is_empty(),
                    "Image ingested"
                );
            }
            Err(e) => {
                counter!("images_ingest_failed").increment(1);
                error!(worker_id = self.worker_id, error = %e, "Image ingestion failed");
            }
        }

        // The submitter may have dropped its handle
        let _ = reply.send(outcome);
    }

    #[instrument(skip_all, fields(worker_id = self.worker_id, file_name = %task.file.file_name))]
    async fn ingest(&self, task: UploadTask) -> IngestionResult<IngestedImage> {
        let UploadTask { file, owner } = task;
        let upload_timeout = self.config.upload_timeout;

        let asset_id = tokio::time::timeout(
            upload_timeout,
            self.asset_store.upload(&file, &self.config.upload_folder),
        )
        .await
        .map_err(|_| IngestionError::UploadTimeout {
            file_name: file.file_name.clone(),
            timeout: upload_timeout,
        })?
        .map_err(|source| IngestionError::Upload {
            file_name: file.file_name.clone(),
            source,
        })?;

        let preview_link = self.await_preview(&asset_id).await?;

        let download_url = self
            .asset_store
            .download_url(&asset_id)
            .await
            .map_err(|source| IngestionError::Link {
                asset_id: asset_id.clone(),
                source,
            })?;

        self.image_store
            .insert(&NewImage {
                asset_id: asset_id.clone(),
                uploaded_by: owner,
                file_name: file.file_name.clone(),
                download_url,
                preview_link: preview_link.clone(),
            })
            .await
            .map_err(|source| IngestionError::Insert {
                asset_id: asset_id.clone(),
                source,
            })?;

        Ok(IngestedImage {
            asset_id,
            file_name: file.file_name,
            preview_link,
        })
    }

    /// Polls for the preview link, returning an empty link once attempts run out
    async fn await_preview(&self, asset_id: &str) -> IngestionResult<String> {
        for attempt in 0..self.config.preview_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.preview_delay).await;
            }

            match self.asset_store.preview_link(asset_id).await {
                Ok(Some(link)) => return Ok(link),
                Ok(None) => debug!(asset_id, attempt, "Preview not ready yet"),
                Err(source) => {
                    return Err(IngestionError::PreviewLookup {
                        asset_id: asset_id.to_string(),
                        source,
                    })
                }
            }
        }

        warn!(asset_id, "Preview not ready, recording image without one");
        Ok(String::new())
    }
}
