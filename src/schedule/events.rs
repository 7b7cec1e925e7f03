use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::progress::BatchProgress;
use crate::schedule::types::{BatchRecord, BatchState, JobRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Cancel,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    BatchProgressUpdate,
    JobStatusUpdate {
        job: JobRecord,
    },
    BatchStatusUpdate,
    BatchControlResult {
        action: ControlAction,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// A state change pushed to the observers of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub batch_id: String,
    pub status: BatchState,
    pub progress: BatchProgress,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl BatchEvent {
    pub fn new(batch: &BatchRecord, progress: BatchProgress, kind: EventKind) -> Self {
        Self {
            batch_id: batch.id.clone(),
            status: batch.state,
            progress,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn is_job_update(&self) -> bool {
        matches!(self.kind, EventKind::JobStatusUpdate { .. })
    }
}
