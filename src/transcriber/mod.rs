use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::schedule::types::JobRecord;

pub mod remote;
#[cfg(feature = "whisper")]
pub mod output;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use remote::RemoteTranscriber;
#[cfg(feature = "whisper")]
pub use whisper::WhisperTranscriber;

/// Handed to a transcription run. Carries the batch's cancellation signal and
/// a channel for fractional progress of the job.
pub struct JobContext {
    cancel: CancellationToken,
    progress: watch::Sender<f64>,
}

impl JobContext {
    pub fn new(cancel: CancellationToken, progress: watch::Sender<f64>) -> Self {
        Self { cancel, progress }
    }

    /// A context nobody listens to, for driving a transcriber directly.
    pub fn detached() -> Self {
        let (progress, _) = watch::channel(0.0);
        Self::new(CancellationToken::new(), progress)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report_progress(&self, progress: f64) {
        // nobody listening is fine
        let _ = self.progress.send(progress);
    }
}

/// The transcription operation. Implementations may take minutes per job and
/// may fail; they should stop early when the context is cancelled, but a run
/// that finishes anyway is tolerated and its result discarded.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Transcribes `job.source_ref` and returns a reference to the result.
    async fn transcribe(&self, job: &JobRecord, ctx: JobContext) -> Result<String>;
}
