use serde::{Deserialize, Serialize};

use crate::schedule::types::{BatchRecord, JobRecord, JobState};

pub const DEFAULT_ETA_WINDOW: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Jobs in a terminal state, whatever the outcome.
    pub completed_jobs: usize,
    pub total_jobs: usize,
    pub failed_jobs: usize,
    pub progress_percentage: u32,
    /// Seconds. Omitted until at least one job has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining: Option<u64>,
}

/// Computes batch-level progress from job states.
///
/// The ETA is a moving average over the durations of the most recently
/// finished jobs, multiplied by the number of jobs still queued. Durations are
/// read from the job records themselves, so the computation carries no state
/// between calls.
#[derive(Debug, Clone, Copy)]
pub struct ProgressAggregator {
    window: usize,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_ETA_WINDOW)
    }
}

impl ProgressAggregator {
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1) }
    }

    pub fn compute(&self, batch: &BatchRecord) -> BatchProgress {
        let total_jobs = batch.jobs.len();
        let completed_jobs = batch.jobs.iter().filter(|job| job.state.is_terminal()).count();
        let failed_jobs = batch.count(JobState::Failed);

        let progress_percentage = if total_jobs > 0 {
            (100.0 * completed_jobs as f64 / total_jobs as f64).round() as u32
        } else {
            0
        };

        let estimated_remaining = self
            .average_job_seconds(&batch.jobs)
            .map(|avg| (avg * batch.count(JobState::Queued) as f64).round() as u64);

        BatchProgress {
            completed_jobs,
            total_jobs,
            failed_jobs,
            progress_percentage,
            estimated_remaining,
        }
    }

    fn average_job_seconds(&self, jobs: &[JobRecord]) -> Option<f64> {
        // cancelled jobs never ran to completion, their durations say nothing
        let mut finished: Vec<&JobRecord> = jobs
            .iter()
            .filter(|job| matches!(job.state, JobState::Completed | JobState::Failed))
            .filter(|job| job.duration().is_some())
            .collect();
        if finished.is_empty() {
            return None;
        }

        finished.sort_by_key(|job| std::cmp::Reverse(job.finished_at));
        let samples: Vec<f64> = finished
            .iter()
            .take(self.window)
            .filter_map(|job| job.duration())
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();

        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}
