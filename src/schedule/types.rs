use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

use crate::error::{BatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Txt,
    Srt,
    Vtt,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Txt => "txt",
            Self::Srt => "srt",
            Self::Vtt => "vtt",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default = "default_output_formats")]
    pub output_formats: Vec<OutputFormat>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub speaker_count: Option<u32>,
}

fn default_output_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Txt]
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            output_formats: default_output_formats(),
            language: None,
            speaker_count: None,
        }
    }
}

/// One unit of work: transcribing a single media source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub source_ref: String,
    pub display_name: String,
    pub options: JobOptions,
    pub state: JobState,
    /// In `[0.0, 1.0]`.
    pub progress: f64,
    /// Present iff `state == Failed`.
    pub error: Option<String>,
    /// Present iff `state == Completed`.
    pub result_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn new(source_ref: String, display_name: Option<String>, mut options: JobOptions) -> Self {
        if options.output_formats.is_empty() {
            options.output_formats = default_output_formats();
        }
        let mut seen = Vec::with_capacity(options.output_formats.len());
        options.output_formats.retain(|format| {
            let first = !seen.contains(format);
            seen.push(*format);
            first
        });
        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_display_name(&source_ref));
        Self {
            id: format!("job-{}", Uuid::new_v4()),
            source_ref,
            display_name,
            options,
            state: JobState::Queued,
            progress: 0.0,
            error: None,
            result_ref: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall-clock time between dispatch and completion, for finished jobs only.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }

    fn cancel(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Cancelled;
        self.result_ref = None;
        self.error = None;
        self.finished_at = Some(now);
    }
}

fn default_display_name(source_ref: &str) -> String {
    source_ref
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or(source_ref)
        .to_string()
}

/// A named collection of jobs processed together under one concurrency limit.
///
/// The state-transition methods here are the only way records change. The
/// scheduler calls them while holding the batch lock, so every mutation is
/// applied to a whole record at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub name: String,
    pub max_concurrent: usize,
    pub jobs: Vec<JobRecord>,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,
    pub cancel_requested: bool,
}

impl BatchRecord {
    pub fn new(name: Option<String>, max_concurrent: usize, callback_url: Option<String>) -> Self {
        let created_at = Utc::now();
        let name = name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("Batch {}", created_at.format("%Y-%m-%d %H:%M:%S")));
        Self {
            id: format!("batch-{}", Uuid::new_v4()),
            name,
            max_concurrent,
            jobs: Vec::new(),
            state: BatchState::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            callback_url,
            cancel_requested: false,
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.id == job_id)
    }

    fn job_mut(&mut self, job_id: &str) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|job| job.id == job_id)
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }

    pub fn add_job(
        &mut self,
        source_ref: String,
        display_name: Option<String>,
        options: JobOptions,
    ) -> Result<&JobRecord> {
        if self.state != BatchState::Pending {
            return Err(BatchError::InvalidState(format!(
                "cannot add jobs to batch {} in state {}",
                self.id, self.state
            )));
        }
        if source_ref.trim().is_empty() {
            return Err(BatchError::InvalidArgument("source_ref must not be empty".to_string()));
        }

        self.jobs.push(JobRecord::new(source_ref, display_name, options));
        Ok(&self.jobs[self.jobs.len() - 1])
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != BatchState::Pending {
            return Err(BatchError::InvalidState(format!(
                "batch {} cannot be started from state {}",
                self.id, self.state
            )));
        }
        if self.jobs.is_empty() {
            return Err(BatchError::InvalidState(format!("batch {} has no jobs", self.id)));
        }

        self.state = BatchState::Processing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Dispatches the first queued job in submission order, if the batch is
    /// still processing.
    pub fn claim_next_job(&mut self) -> Option<JobRecord> {
        if self.state != BatchState::Processing || self.cancel_requested {
            return None;
        }

        let job = self.jobs.iter_mut().find(|job| job.state == JobState::Queued)?;
        job.state = JobState::Running;
        job.progress = 0.0;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    /// Raises a running job's progress. Returns the updated job, or `None` when
    /// the value does not move progress forward.
    pub fn report_progress(&mut self, job_id: &str, progress: f64) -> Option<&JobRecord> {
        if self.state != BatchState::Processing {
            return None;
        }

        let job = self.job_mut(job_id)?;
        let progress = if progress.is_finite() { progress.clamp(0.0, 1.0) } else { return None };
        if job.state != JobState::Running || progress <= job.progress {
            return None;
        }
        job.progress = progress;
        Some(&*job)
    }

    /// Records the terminal outcome of a running job.
    ///
    /// A job that was cancelled while its transcription was in flight stays
    /// cancelled and the late outcome is rejected with `CancellationRace`.
    pub fn finish_job(
        &mut self,
        job_id: &str,
        outcome: std::result::Result<String, String>,
    ) -> Result<&JobRecord> {
        let batch_id = self.id.clone();
        let batch_state = self.state;
        let job = self
            .job_mut(job_id)
            .ok_or_else(|| BatchError::job_not_found(&batch_id, job_id))?;

        match job.state {
            JobState::Running => {}
            JobState::Cancelled if batch_state == BatchState::Cancelled => {
                return Err(BatchError::CancellationRace { job_id: job_id.to_string() });
            }
            state => {
                return Err(BatchError::InvalidState(format!(
                    "job {} cannot finish from state {}",
                    job_id, state
                )));
            }
        }

        job.finished_at = Some(Utc::now());
        match outcome {
            Ok(result_ref) => {
                job.state = JobState::Completed;
                job.progress = 1.0;
                job.result_ref = Some(result_ref);
                job.error = None;
            }
            Err(message) => {
                job.state = JobState::Failed;
                job.error = Some(message);
                job.result_ref = None;
            }
        }
        Ok(&*job)
    }

    /// Honors a cancel request. Every non-terminal job becomes `Cancelled`.
    /// Returns `false` when the batch was already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        let now = Utc::now();
        self.cancel_requested = true;
        for job in self.jobs.iter_mut().filter(|job| !job.state.is_terminal()) {
            job.cancel(now);
        }
        self.state = BatchState::Cancelled;
        self.finished_at = Some(now);
        true
    }

    /// Moves a processing batch whose jobs are all terminal into its final state.
    pub fn settle(&mut self) -> bool {
        if self.state != BatchState::Processing || self.jobs.iter().any(|job| !job.state.is_terminal()) {
            return false;
        }

        self.state = if self.count(JobState::Cancelled) > 0 {
            BatchState::Cancelled
        } else if self.count(JobState::Failed) > 0 {
            BatchState::Failed
        } else {
            BatchState::Completed
        };
        self.finished_at = Some(Utc::now());
        true
    }

    /// Fails the running jobs of a processing batch, leaving queued ones
    /// untouched. Returns whether any job changed.
    pub fn fail_running(&mut self, reason: &str) -> bool {
        if self.state != BatchState::Processing {
            return false;
        }

        let now = Utc::now();
        let mut changed = false;
        for job in self.jobs.iter_mut().filter(|job| job.state == JobState::Running) {
            job.state = JobState::Failed;
            job.error = Some(reason.to_string());
            job.finished_at = Some(now);
            changed = true;
        }
        changed
    }

    /// Settles a processing batch whose jobs can no longer report back, e.g.
    /// after a restart. Unfinished jobs are failed with `reason`.
    pub fn fail_unfinished(&mut self, reason: &str) -> bool {
        if self.state != BatchState::Processing {
            return false;
        }

        let now = Utc::now();
        for job in self.jobs.iter_mut().filter(|job| !job.state.is_terminal()) {
            job.state = JobState::Failed;
            job.error = Some(reason.to_string());
            job.finished_at = Some(now);
        }
        self.settle()
    }
}
