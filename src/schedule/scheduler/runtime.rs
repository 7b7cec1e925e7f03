use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::schedule::events::{BatchEvent, EventKind};
use crate::schedule::notify::NotificationHub;
use crate::schedule::progress::{BatchProgress, ProgressAggregator};
use crate::schedule::types::BatchRecord;
use crate::storage::batch::BatchStore;
use crate::transcriber::Transcriber;

/// A batch snapshot together with its aggregated progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchView {
    #[serde(flatten)]
    pub batch: BatchRecord,
    pub progress: BatchProgress,
}

/// Collaborators shared by the scheduler and every running batch.
pub(crate) struct BatchRuntime {
    pub store: Arc<dyn BatchStore>,
    pub hub: Arc<NotificationHub>,
    pub transcriber: Arc<dyn Transcriber>,
    pub aggregator: ProgressAggregator,
}

impl BatchRuntime {
    /// Writes through to the store. Used on paths where the in-memory record
    /// must move forward even if persistence fails.
    pub async fn persist(&self, record: &BatchRecord) {
        if let Err(e) = self.store.save(record).await {
            error!("Failed to persist batch {}: {}", record.id, e);
        }
    }

    pub fn publish(&self, record: &BatchRecord, kind: EventKind) {
        let progress = self.aggregator.compute(record);
        self.hub.publish(&BatchEvent::new(record, progress, kind));
    }

    pub fn view(&self, record: &BatchRecord) -> BatchView {
        BatchView {
            progress: self.aggregator.compute(record),
            batch: record.clone(),
        }
    }
}

/// Live state of one batch. The record mutex is the batch's only shared
/// mutable structure: dispatch, job outcomes and control operations all go
/// through it, and the store is written while it is held.
pub(crate) struct BatchSlot {
    pub record: Mutex<BatchRecord>,
    pub cancel: CancellationToken,
    deleted: AtomicBool,
    done: watch::Sender<bool>,
}

impl BatchSlot {
    pub fn new(record: BatchRecord) -> Arc<Self> {
        let (done, _) = watch::channel(record.state.is_terminal());
        Arc::new(Self {
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
            deleted: AtomicBool::new(false),
            done,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Signals that no worker of this batch is running anymore.
    pub fn mark_done(&self) {
        self.done.send_replace(true);
    }

    pub async fn wait_done(&self) {
        let mut done = self.done.subscribe();
        // the sender lives as long as the slot, so this only ends on `true`
        let _ = done.wait_for(|done| *done).await;
    }
}
