use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::runtime::{BatchRuntime, BatchSlot};
use super::worker::BatchWorker;

/// Runs the jobs of one batch with at most `size` of them in flight.
///
/// Each worker claims the first queued job under the batch lock, so a job is
/// dispatched exactly once and in submission order. A failed job only ends
/// that job; the worker moves on to the next one.
pub(crate) struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            size: max_concurrent.max(1),
        }
    }

    pub async fn run(&self, runtime: Arc<BatchRuntime>, slot: Arc<BatchSlot>) {
        let (batch_id, job_count) = {
            let record = slot.record.lock().await;
            (record.id.clone(), record.jobs.len())
        };
        let workers = self.size.min(job_count);
        info!("Starting {} workers for batch {}", workers, batch_id);

        let mut set = JoinSet::new();
        for index in 0..workers {
            let worker = BatchWorker::new(index, runtime.clone(), slot.clone());
            set.spawn(worker.run());
        }

        // a dead worker is replaced so the pool keeps its size, at most once per job
        let mut replacements = job_count;
        let mut next_index = workers;
        while let Some(joined) = set.join_next().await {
            let Err(e) = joined else {
                continue;
            };
            error!("Worker of batch {} stopped abnormally: {}", batch_id, e);
            if replacements == 0 || slot.cancel.is_cancelled() {
                continue;
            }
            replacements -= 1;
            let worker = BatchWorker::new(next_index, runtime.clone(), slot.clone());
            next_index += 1;
            set.spawn(worker.run());
        }
        info!("All workers of batch {} have stopped", batch_id);
    }
}
