use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::runtime::{BatchRuntime, BatchSlot};
use crate::error::BatchError;
use crate::schedule::events::EventKind;
use crate::schedule::types::JobRecord;
use crate::transcriber::JobContext;

pub(crate) struct BatchWorker {
    // position in the pool, for logs
    index: usize,
    runtime: Arc<BatchRuntime>,
    slot: Arc<BatchSlot>,
}

impl BatchWorker {
    pub fn new(index: usize, runtime: Arc<BatchRuntime>, slot: Arc<BatchSlot>) -> Self {
        Self { index, runtime, slot }
    }

    /// Runs queued jobs one after another until none is left or the batch
    /// stops dispatching.
    pub async fn run(self) {
        while let Some(job) = self.claim_next_job().await {
            self.execute(job).await;
        }
        debug!("Worker {} has no more jobs", self.index);
    }

    async fn claim_next_job(&self) -> Option<JobRecord> {
        let mut record = self.slot.record.lock().await;
        if self.slot.is_deleted() {
            return None;
        }
        let job = record.claim_next_job()?;
        info!("Worker {} dispatched job {} of batch {}", self.index, job.id, record.id);

        self.runtime.persist(&record).await;
        self.runtime.publish(&record, EventKind::JobStatusUpdate { job: job.clone() });
        Some(job)
    }

    async fn execute(&self, job: JobRecord) {
        let (progress_tx, mut progress_rx) = watch::channel(0.0);
        let ctx = JobContext::new(self.slot.cancel.child_token(), progress_tx);

        // a panicking transcriber fails its job, the worker keeps going
        let transcription = AssertUnwindSafe(self.runtime.transcriber.transcribe(&job, ctx))
            .catch_unwind()
            .map(|joined| {
                joined.unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("transcriber panicked: {}", panic_message(&*panic)))
                })
            });
        tokio::pin!(transcription);

        let result = loop {
            tokio::select! {
                result = &mut transcription => break result,
                changed = progress_rx.changed() => match changed {
                    Ok(()) => {
                        let progress = *progress_rx.borrow_and_update();
                        self.report_progress(&job, progress).await;
                    }
                    // the transcriber let go of its context, nothing more to report
                    Err(_) => break (&mut transcription).await,
                },
            }
        };

        let outcome = result.map_err(|e| {
            let failure = BatchError::JobExecution {
                job_id: job.id.clone(),
                message: format!("{:#}", e),
            };
            warn!("{}", failure);
            format!("{:#}", e)
        });

        let mut record = self.slot.record.lock().await;
        if self.slot.is_deleted() {
            return;
        }
        let finished = match record.finish_job(&job.id, outcome) {
            Ok(finished) => finished.clone(),
            Err(e @ BatchError::CancellationRace { .. }) => {
                info!("Discarding outcome: {}", e);
                return;
            }
            Err(e) => {
                error!("Failed to record outcome of job {}: {}", job.id, e);
                return;
            }
        };

        info!("Job {} of batch {} finished as {}", job.id, record.id, finished.state);
        self.runtime.persist(&record).await;
        self.runtime.publish(&record, EventKind::JobStatusUpdate { job: finished });
        self.runtime.publish(&record, EventKind::BatchProgressUpdate);
    }

    async fn report_progress(&self, job: &JobRecord, progress: f64) {
        let mut record = self.slot.record.lock().await;
        let Some(updated) = record.report_progress(&job.id, progress).cloned() else {
            return;
        };
        self.runtime.publish(&record, EventKind::JobStatusUpdate { job: updated });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
