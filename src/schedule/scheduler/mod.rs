mod pool;
mod runtime;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub use runtime::BatchView;

use crate::error::{BatchError, Result};
use crate::schedule::events::{ControlAction, EventKind};
use crate::schedule::notify::{HttpCallback, NotificationHub, Observer};
use crate::schedule::progress::{ProgressAggregator, DEFAULT_ETA_WINDOW};
use crate::schedule::types::{BatchRecord, BatchState, JobOptions, JobRecord, JobState};
use crate::storage::batch::BatchStore;
use crate::transcriber::Transcriber;
use pool::WorkerPool;
use runtime::{BatchRuntime, BatchSlot};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Used when a batch is created without `max_concurrent`.
    pub default_max_concurrent: usize,
    /// Process-wide ceiling for a batch's `max_concurrent`.
    pub max_concurrent_limit: usize,
    /// Number of recent job durations the ETA averages over.
    pub eta_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: 2,
            max_concurrent_limit: 8,
            eta_window: DEFAULT_ETA_WINDOW,
        }
    }
}

/// Owns batch lifecycles: creation, job intake, start, cancellation and
/// deletion. Each started batch gets a driver task running a `WorkerPool`.
pub struct BatchScheduler {
    runtime: Arc<BatchRuntime>,
    config: SchedulerConfig,
    batches: RwLock<HashMap<String, Arc<BatchSlot>>>,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<dyn BatchStore>,
        transcriber: Arc<dyn Transcriber>,
        hub: Arc<NotificationHub>,
        config: SchedulerConfig,
    ) -> Self {
        info!("Using {} transcriber", transcriber.name());
        let runtime = BatchRuntime {
            store,
            hub,
            transcriber,
            aggregator: ProgressAggregator::new(config.eta_window),
        };
        Self {
            runtime: Arc::new(runtime),
            config,
            batches: RwLock::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.runtime.hub
    }

    /// Loads persisted batches. Batches that were processing when the
    /// previous process stopped are settled, since nothing runs their jobs
    /// anymore. Returns the number of batches loaded.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.runtime.store.list().await?;
        let mut batches = self.batches.write().await;
        for mut record in records {
            if record.fail_unfinished("interrupted by service restart") {
                warn!("Batch {} was interrupted by a restart, settled as {}", record.id, record.state);
                self.runtime.store.save(&record).await?;
            }
            batches.insert(record.id.clone(), BatchSlot::new(record));
        }
        info!("Restored {} batches", batches.len());
        Ok(batches.len())
    }

    async fn slot(&self, batch_id: &str) -> Result<Arc<BatchSlot>> {
        self.batches
            .read()
            .await
            .get(batch_id)
            .cloned()
            .ok_or_else(|| BatchError::batch_not_found(batch_id))
    }

    pub async fn create_batch(
        &self,
        name: Option<String>,
        max_concurrent: Option<usize>,
        callback_url: Option<String>,
    ) -> Result<BatchRecord> {
        let max_concurrent = max_concurrent.unwrap_or(self.config.default_max_concurrent);
        if max_concurrent == 0 || max_concurrent > self.config.max_concurrent_limit {
            return Err(BatchError::InvalidArgument(format!(
                "max_concurrent must be between 1 and {}, got {}",
                self.config.max_concurrent_limit, max_concurrent
            )));
        }
        if let Some(url) = &callback_url {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| BatchError::InvalidArgument(format!("invalid callback_url {}: {}", url, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(BatchError::InvalidArgument(format!("callback_url must be http(s): {}", url)));
            }
        }

        let record = BatchRecord::new(name, max_concurrent, callback_url);
        self.runtime.store.save(&record).await?;
        self.batches
            .write()
            .await
            .insert(record.id.clone(), BatchSlot::new(record.clone()));

        info!("Created batch {} ({}) with max_concurrent {}", record.id, record.name, max_concurrent);
        Ok(record)
    }

    pub async fn add_job(
        &self,
        batch_id: &str,
        source_ref: String,
        display_name: Option<String>,
        options: Option<JobOptions>,
    ) -> Result<JobRecord> {
        let slot = self.slot(batch_id).await?;
        let mut record = slot.record.lock().await;
        if slot.is_deleted() {
            return Err(BatchError::batch_not_found(batch_id));
        }

        let mut next = record.clone();
        let job = next
            .add_job(source_ref, display_name, options.unwrap_or_default())?
            .clone();
        self.runtime.store.save(&next).await?;
        *record = next;

        info!("Added job {} ({}) to batch {}", job.id, job.source_ref, batch_id);
        self.runtime.publish(&record, EventKind::JobStatusUpdate { job: job.clone() });
        Ok(job)
    }

    pub async fn start_batch(&self, batch_id: &str) -> Result<()> {
        let slot = self.slot(batch_id).await?;
        let mut record = slot.record.lock().await;
        if slot.is_deleted() {
            return Err(BatchError::batch_not_found(batch_id));
        }

        let mut next = record.clone();
        if let Err(e) = next.start() {
            self.publish_control(&record, ControlAction::Start, Some(e.to_string()));
            return Err(e);
        }
        self.runtime.store.save(&next).await?;
        *record = next;

        if let Some(url) = &record.callback_url {
            HttpCallback::new(url.clone()).spawn_forwarder(&self.runtime.hub, batch_id);
        }

        info!("Starting batch {} with {} jobs", batch_id, record.jobs.len());
        self.runtime.publish(&record, EventKind::BatchStatusUpdate);
        self.publish_control(&record, ControlAction::Start, None);

        // the driver blocks on the record lock until this call returns
        let runtime = self.runtime.clone();
        let pool = WorkerPool::new(record.max_concurrent);
        tokio::spawn(drive(runtime, slot.clone(), pool));
        Ok(())
    }

    /// Stops dispatching immediately and cancels every unfinished job.
    /// Jobs whose transcription cannot be interrupted keep running, but their
    /// outcome is discarded. Cancelling a terminal batch is a no-op.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<()> {
        let slot = self.slot(batch_id).await?;
        let mut record = slot.record.lock().await;
        if slot.is_deleted() {
            return Err(BatchError::batch_not_found(batch_id));
        }

        let was_pending = record.state == BatchState::Pending;
        let unfinished: Vec<String> = record
            .jobs
            .iter()
            .filter(|job| !job.state.is_terminal())
            .map(|job| job.id.clone())
            .collect();

        if !record.cancel() {
            self.publish_control(&record, ControlAction::Cancel, None);
            return Ok(());
        }
        slot.cancel.cancel();
        if was_pending {
            slot.mark_done();
        }
        self.runtime.persist(&record).await;

        info!("Cancelled batch {} ({} unfinished jobs)", batch_id, unfinished.len());
        for job in record.jobs.iter().filter(|job| unfinished.contains(&job.id)) {
            self.runtime.publish(&record, EventKind::JobStatusUpdate { job: job.clone() });
        }
        self.runtime.publish(&record, EventKind::BatchProgressUpdate);
        self.runtime.publish(&record, EventKind::BatchStatusUpdate);
        self.publish_control(&record, ControlAction::Cancel, None);
        Ok(())
    }

    /// Deletes a batch that is not processing.
    pub async fn delete_batch(&self, batch_id: &str) -> Result<()> {
        let slot = self.slot(batch_id).await?;
        let record = slot.record.lock().await;
        if slot.is_deleted() {
            return Err(BatchError::batch_not_found(batch_id));
        }
        if record.state == BatchState::Processing {
            let message = format!("batch {} is processing, cancel it first", batch_id);
            self.publish_control(&record, ControlAction::Delete, Some(message.clone()));
            return Err(BatchError::InvalidState(message));
        }

        self.runtime.store.delete(batch_id).await?;
        slot.mark_deleted();
        self.batches.write().await.remove(batch_id);

        info!("Deleted batch {}", batch_id);
        self.publish_control(&record, ControlAction::Delete, None);
        self.runtime.hub.remove_batch(batch_id);
        Ok(())
    }

    /// Cancels the batch if it is processing, then deletes it.
    pub async fn force_delete_batch(&self, batch_id: &str) -> Result<()> {
        self.cancel_batch(batch_id).await?;
        self.delete_batch(batch_id).await
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<BatchView> {
        let slot = self.slot(batch_id).await?;
        let record = slot.record.lock().await;
        Ok(self.runtime.view(&record))
    }

    pub async fn get_job(&self, batch_id: &str, job_id: &str) -> Result<JobRecord> {
        let slot = self.slot(batch_id).await?;
        let record = slot.record.lock().await;
        record
            .job(job_id)
            .cloned()
            .ok_or_else(|| BatchError::job_not_found(batch_id, job_id))
    }

    /// Every known batch, oldest first.
    pub async fn list_batches(&self) -> Vec<BatchView> {
        let slots: Vec<Arc<BatchSlot>> = self.batches.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            let record = slot.record.lock().await;
            views.push(self.runtime.view(&record));
        }
        views.sort_by(|a, b| {
            a.batch
                .created_at
                .cmp(&b.batch.created_at)
                .then_with(|| a.batch.id.cmp(&b.batch.id))
        });
        views
    }

    /// Registers a new observer for the batch's events.
    pub async fn subscribe(&self, batch_id: &str) -> Result<Observer> {
        self.slot(batch_id).await?;
        let mut observer = self.runtime.hub.observer();
        self.runtime.hub.subscribe(batch_id, &mut observer);
        Ok(observer)
    }

    /// Waits until no worker of a started batch is running anymore and
    /// returns its final snapshot.
    pub async fn wait_for_batch(&self, batch_id: &str) -> Result<BatchView> {
        let slot = self.slot(batch_id).await?;
        if slot.record.lock().await.state == BatchState::Pending {
            return Err(BatchError::InvalidState(format!("batch {} has not been started", batch_id)));
        }
        slot.wait_done().await;
        let record = slot.record.lock().await;
        Ok(self.runtime.view(&record))
    }

    /// Cancels every processing batch and waits for their workers to stop.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<BatchSlot>)> = self
            .batches
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (batch_id, slot) in &slots {
            if slot.record.lock().await.state != BatchState::Processing {
                continue;
            }
            if let Err(e) = self.cancel_batch(batch_id).await {
                warn!("Failed to cancel batch {} during shutdown: {}", batch_id, e);
            }
        }
        for (_, slot) in slots {
            if slot.record.lock().await.state != BatchState::Pending {
                slot.wait_done().await;
            }
        }
        info!("Scheduler shut down");
    }

    fn publish_control(&self, record: &BatchRecord, action: ControlAction, error: Option<String>) {
        self.runtime.publish(
            record,
            EventKind::BatchControlResult {
                action,
                success: error.is_none(),
                message: error,
            },
        );
    }
}

/// Per-batch driver: runs the pool, then moves the batch into its final state.
async fn drive(runtime: Arc<BatchRuntime>, slot: Arc<BatchSlot>, pool: WorkerPool) {
    pool.run(runtime.clone(), slot.clone()).await;

    let mut record = slot.record.lock().await;
    if !slot.is_deleted() && record.state == BatchState::Processing {
        // jobs still running here lost their worker
        record.fail_running("worker stopped before the job finished");
        if !record.settle() {
            error!(
                "Batch {} still has {} queued jobs after its workers stopped",
                record.id,
                record.count(JobState::Queued)
            );
        } else {
            info!(
                "Batch {} finished as {} ({} completed, {} failed)",
                record.id,
                record.state,
                record.count(JobState::Completed),
                record.count(JobState::Failed)
            );
            runtime.persist(&record).await;
            runtime.publish(&record, EventKind::BatchProgressUpdate);
            runtime.publish(&record, EventKind::BatchStatusUpdate);
        }
    }
    drop(record);
    slot.mark_done();
}
