use super::*;
use crate::error::BatchError;
use crate::storage::batch::MemoryBatchStore;
use crate::transcriber::JobContext;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

// 测试用转写器：可控制失败、阻塞和并发统计
#[derive(Default)]
struct ScriptedTranscriber {
    failing: HashSet<String>,
    panicking: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedTranscriber {
    fn failing(sources: &[&str]) -> Self {
        Self {
            failing: sources.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn transcribe(&self, job: &JobRecord, ctx: JobContext) -> Result<String> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(job.source_ref.clone());
        if self.panicking.contains(&job.source_ref) {
            self.running.fetch_sub(1, Ordering::SeqCst);
            panic!("decoder crashed on {}", job.source_ref);
        }

        ctx.report_progress(0.5);
        match &self.gate {
            // ignores cancellation on purpose, like a transcription that cannot be interrupted
            Some(gate) => {
                let _permit = gate.acquire().await?;
            }
            None => sleep(Duration::from_millis(20)).await,
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.failing.contains(&job.source_ref) {
            return Err(anyhow::anyhow!("could not decode {}", job.source_ref));
        }
        Ok(format!("{}.txt", job.source_ref))
    }
}

fn setup_scheduler(transcriber: Arc<ScriptedTranscriber>) -> BatchScheduler {
    BatchScheduler::new(
        Arc::new(MemoryBatchStore::new()),
        transcriber,
        Arc::new(NotificationHub::new(1024)),
        SchedulerConfig::default(),
    )
}

async fn create_batch_with_jobs(scheduler: &BatchScheduler, max_concurrent: usize, jobs: usize) -> Result<BatchRecord> {
    let batch = scheduler
        .create_batch(Some("test batch".into()), Some(max_concurrent), None)
        .await?;
    for i in 1..=jobs {
        scheduler
            .add_job(&batch.id, format!("video-{}.mp4", i), None, None)
            .await?;
    }
    Ok(batch)
}

async fn wait_until_running(transcriber: &ScriptedTranscriber, count: usize) {
    timeout(Duration::from_secs(5), async {
        while transcriber.running.load(Ordering::SeqCst) < count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("jobs did not start in time");
}

#[tokio::test]
async fn test_all_jobs_succeed() -> Result<()> {
    let transcriber = Arc::new(ScriptedTranscriber::default());
    let scheduler = setup_scheduler(transcriber.clone());
    let batch = create_batch_with_jobs(&scheduler, 2, 5).await?;

    scheduler.start_batch(&batch.id).await?;
    let view = timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;

    assert_eq!(view.batch.state, BatchState::Completed);
    assert_eq!(view.progress.completed_jobs, 5);
    assert_eq!(view.progress.failed_jobs, 0);
    assert_eq!(view.progress.progress_percentage, 100);
    assert!(view.batch.jobs.iter().all(|job| job.result_ref.is_some() && job.progress == 1.0));
    assert!(transcriber.peak.load(Ordering::SeqCst) <= 2);
    Ok(())
}

#[tokio::test]
async fn test_partial_failure_fails_batch() -> Result<()> {
    let transcriber = Arc::new(ScriptedTranscriber::failing(&["video-2.mp4"]));
    let scheduler = setup_scheduler(transcriber);
    let batch = create_batch_with_jobs(&scheduler, 2, 3).await?;

    scheduler.start_batch(&batch.id).await?;
    let view = timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;

    assert_eq!(view.batch.state, BatchState::Failed);
    assert_eq!(view.progress.failed_jobs, 1);
    assert_eq!(view.batch.jobs[0].state, JobState::Completed);
    assert_eq!(view.batch.jobs[1].state, JobState::Failed);
    assert_eq!(view.batch.jobs[2].state, JobState::Completed);
    assert_eq!(
        view.batch.jobs[1].error.as_deref(),
        Some("could not decode video-2.mp4")
    );
    assert!(view.batch.jobs[1].result_ref.is_none());
    Ok(())
}

#[tokio::test]
async fn test_concurrency_bound_and_fifo_dispatch() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let transcriber = Arc::new(ScriptedTranscriber::gated(gate.clone()));
    let scheduler = setup_scheduler(transcriber.clone());
    let batch = create_batch_with_jobs(&scheduler, 3, 8).await?;

    scheduler.start_batch(&batch.id).await?;
    wait_until_running(&transcriber, 3).await;
    sleep(Duration::from_millis(20)).await;

    let view = scheduler.get_batch(&batch.id).await?;
    assert_eq!(view.batch.jobs.iter().filter(|job| job.state == JobState::Running).count(), 3);
    let running: Vec<usize> = view
        .batch
        .jobs
        .iter()
        .enumerate()
        .filter(|(_, job)| job.state == JobState::Running)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(running, vec![0, 1, 2]);

    gate.add_permits(100);
    let view = timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;
    assert_eq!(view.batch.state, BatchState::Completed);
    assert_eq!(transcriber.peak.load(Ordering::SeqCst), 3);

    // dispatch timestamps follow submission order
    let started: Vec<_> = view.batch.jobs.iter().map(|job| job.started_at.unwrap()).collect();
    assert!(started.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(transcriber.started().len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_single_worker_runs_in_submission_order() -> Result<()> {
    let transcriber = Arc::new(ScriptedTranscriber::default());
    let scheduler = setup_scheduler(transcriber.clone());
    let batch = create_batch_with_jobs(&scheduler, 1, 4).await?;

    scheduler.start_batch(&batch.id).await?;
    timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;

    assert_eq!(
        transcriber.started(),
        vec!["video-1.mp4", "video-2.mp4", "video-3.mp4", "video-4.mp4"]
    );
    assert_eq!(transcriber.peak.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_while_running_discards_late_results() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let transcriber = Arc::new(ScriptedTranscriber::gated(gate.clone()));
    let scheduler = setup_scheduler(transcriber.clone());
    let batch = create_batch_with_jobs(&scheduler, 2, 4).await?;

    scheduler.start_batch(&batch.id).await?;
    wait_until_running(&transcriber, 2).await;

    scheduler.cancel_batch(&batch.id).await?;
    let view = scheduler.get_batch(&batch.id).await?;
    assert_eq!(view.batch.state, BatchState::Cancelled);
    assert!(view.batch.jobs.iter().all(|job| job.state == JobState::Cancelled));

    // the in-flight transcriptions now report success
    gate.add_permits(100);
    let view = timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;
    assert_eq!(view.batch.state, BatchState::Cancelled);
    assert!(view
        .batch
        .jobs
        .iter()
        .all(|job| job.state == JobState::Cancelled && job.result_ref.is_none()));
    assert_eq!(transcriber.started().len(), 2);
    assert_eq!(view.progress.failed_jobs, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_is_idempotent() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let transcriber = Arc::new(ScriptedTranscriber::gated(gate.clone()));
    let scheduler = setup_scheduler(transcriber.clone());
    let batch = create_batch_with_jobs(&scheduler, 1, 2).await?;

    scheduler.start_batch(&batch.id).await?;
    wait_until_running(&transcriber, 1).await;

    scheduler.cancel_batch(&batch.id).await?;
    let once = scheduler.get_batch(&batch.id).await?;
    scheduler.cancel_batch(&batch.id).await?;
    let twice = scheduler.get_batch(&batch.id).await?;
    assert_eq!(once.batch.state, BatchState::Cancelled);
    assert_eq!(once, twice);

    gate.add_permits(10);
    let unknown = scheduler.cancel_batch("batch-missing").await.unwrap_err();
    assert!(matches!(unknown, BatchError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_add_job_after_start_is_rejected() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let transcriber = Arc::new(ScriptedTranscriber::gated(gate.clone()));
    let scheduler = setup_scheduler(transcriber);
    let batch = create_batch_with_jobs(&scheduler, 1, 2).await?;

    scheduler.start_batch(&batch.id).await?;
    let err = scheduler
        .add_job(&batch.id, "late.mp4".into(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::InvalidState(_)));
    assert_eq!(scheduler.get_batch(&batch.id).await?.progress.total_jobs, 2);

    gate.add_permits(10);
    timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_start_only_one_wins() -> Result<()> {
    let transcriber = Arc::new(ScriptedTranscriber::default());
    let scheduler = Arc::new(setup_scheduler(transcriber));
    let batch = create_batch_with_jobs(&scheduler, 2, 2).await?;

    let (a, b) = tokio::join!(
        {
            let scheduler = scheduler.clone();
            let id = batch.id.clone();
            tokio::spawn(async move { scheduler.start_batch(&id).await })
        },
        {
            let scheduler = scheduler.clone();
            let id = batch.id.clone();
            tokio::spawn(async move { scheduler.start_batch(&id).await })
        }
    );
    let results = [a?, b?];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(BatchError::InvalidState(_)))));

    timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;
    Ok(())
}

#[tokio::test]
async fn test_start_rejections() -> Result<()> {
    let scheduler = setup_scheduler(Arc::new(ScriptedTranscriber::default()));

    let empty = scheduler.create_batch(None, None, None).await?;
    assert!(matches!(
        scheduler.start_batch(&empty.id).await,
        Err(BatchError::InvalidState(_))
    ));
    assert!(matches!(
        scheduler.start_batch("batch-missing").await,
        Err(BatchError::NotFound(_))
    ));
    assert!(matches!(
        scheduler.create_batch(None, Some(0), None).await,
        Err(BatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        scheduler.create_batch(None, Some(100), None).await,
        Err(BatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        scheduler.create_batch(None, None, Some("ftp://example.com".into())).await,
        Err(BatchError::InvalidArgument(_))
    ));

    let done = create_batch_with_jobs(&scheduler, 1, 1).await?;
    scheduler.start_batch(&done.id).await?;
    timeout(Duration::from_secs(5), scheduler.wait_for_batch(&done.id)).await??;
    // terminal batches cannot be restarted
    assert!(matches!(
        scheduler.start_batch(&done.id).await,
        Err(BatchError::InvalidState(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_events_are_ordered_and_progress_is_monotonic() -> Result<()> {
    let transcriber = Arc::new(ScriptedTranscriber::failing(&["video-3.mp4"]));
    let scheduler = setup_scheduler(transcriber);
    let batch = create_batch_with_jobs(&scheduler, 2, 6).await?;
    let mut observer = scheduler.subscribe(&batch.id).await?;

    scheduler.start_batch(&batch.id).await?;

    let mut events = Vec::new();
    timeout(Duration::from_secs(5), async {
        while let Some(event) = observer.recv().await {
            let terminal = matches!(event.kind, EventKind::BatchStatusUpdate) && event.status.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
    })
    .await?;

    assert!(matches!(events[0].kind, EventKind::BatchStatusUpdate));
    assert_eq!(events[0].status, BatchState::Processing);
    let last = events.last().unwrap();
    assert_eq!(last.status, BatchState::Failed);
    assert_eq!(last.progress.progress_percentage, 100);
    assert_eq!(last.progress.failed_jobs, 1);

    let percentages: Vec<u32> = events.iter().map(|e| e.progress.progress_percentage).collect();
    assert!(percentages.windows(2).all(|pair| pair[0] <= pair[1]));

    for event in &events {
        assert_eq!(event.batch_id, batch.id);
        assert!(event.progress.completed_jobs <= event.progress.total_jobs);
    }
    let timestamps: Vec<_> = events.iter().map(|e| e.timestamp).collect();
    assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));

    // every job reported running then a terminal state
    let job_updates = events.iter().filter(|e| e.is_job_update()).count();
    assert!(job_updates >= 12);
    Ok(())
}

#[tokio::test]
async fn test_job_counts_always_add_up() -> Result<()> {
    let transcriber = Arc::new(ScriptedTranscriber::default());
    let scheduler = setup_scheduler(transcriber);
    let batch = create_batch_with_jobs(&scheduler, 3, 10).await?;

    scheduler.start_batch(&batch.id).await?;
    loop {
        let view = scheduler.get_batch(&batch.id).await?;
        let queued = view.batch.jobs.iter().filter(|j| j.state == JobState::Queued).count();
        let running = view.batch.jobs.iter().filter(|j| j.state == JobState::Running).count();
        assert_eq!(view.progress.completed_jobs + queued + running, view.progress.total_jobs);
        assert!(running <= 3);
        if view.batch.state.is_terminal() {
            break;
        }
        sleep(Duration::from_millis(3)).await;
    }
    Ok(())
}

#[tokio::test]
async fn test_delete_rules() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let transcriber = Arc::new(ScriptedTranscriber::gated(gate.clone()));
    let scheduler = setup_scheduler(transcriber.clone());

    let pending = create_batch_with_jobs(&scheduler, 1, 1).await?;
    scheduler.delete_batch(&pending.id).await?;
    assert!(matches!(
        scheduler.get_batch(&pending.id).await,
        Err(BatchError::NotFound(_))
    ));

    let running = create_batch_with_jobs(&scheduler, 1, 2).await?;
    scheduler.start_batch(&running.id).await?;
    wait_until_running(&transcriber, 1).await;
    assert!(matches!(
        scheduler.delete_batch(&running.id).await,
        Err(BatchError::InvalidState(_))
    ));

    let mut observer = scheduler.subscribe(&running.id).await?;
    scheduler.force_delete_batch(&running.id).await?;
    assert!(matches!(
        scheduler.get_batch(&running.id).await,
        Err(BatchError::NotFound(_))
    ));
    assert!(scheduler.list_batches().await.is_empty());

    // the observer sees the cancellation and deletion, then its stream ends
    let mut kinds = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(1), observer.recv()).await? {
        kinds.push(event.kind);
    }
    assert!(matches!(
        kinds.last(),
        Some(EventKind::BatchControlResult { action: ControlAction::Delete, success: true, .. })
    ));

    // the in-flight job finishing later does not resurrect the batch
    gate.add_permits(10);
    sleep(Duration::from_millis(50)).await;
    assert!(scheduler.list_batches().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_list_and_get_job() -> Result<()> {
    let scheduler = setup_scheduler(Arc::new(ScriptedTranscriber::default()));
    let first = create_batch_with_jobs(&scheduler, 1, 2).await?;
    let second = scheduler.create_batch(None, None, None).await?;

    let batches = scheduler.list_batches().await;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].batch.id, first.id);
    assert_eq!(batches[1].batch.id, second.id);
    assert_eq!(batches[1].batch.max_concurrent, 2);
    assert_eq!(batches[0].progress.total_jobs, 2);

    let job_id = batches[0].batch.jobs[1].id.clone();
    let job = scheduler.get_job(&first.id, &job_id).await?;
    assert_eq!(job.source_ref, "video-2.mp4");
    assert_eq!(job.state, JobState::Queued);
    assert!(matches!(
        scheduler.get_job(&first.id, "job-missing").await,
        Err(BatchError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_restore_settles_interrupted_batches() -> Result<()> {
    let store = Arc::new(MemoryBatchStore::new());
    let mut interrupted = BatchRecord::new(Some("interrupted".into()), 2, None);
    interrupted.add_job("a.mp4".into(), None, JobOptions::default())?;
    interrupted.add_job("b.mp4".into(), None, JobOptions::default())?;
    interrupted.start()?;
    let job = interrupted.claim_next_job().unwrap();
    interrupted.finish_job(&job.id, Ok("a.txt".into()))?;
    interrupted.claim_next_job().unwrap();
    store.save(&interrupted).await?;

    let scheduler = BatchScheduler::new(
        store.clone(),
        Arc::new(ScriptedTranscriber::default()),
        Arc::new(NotificationHub::default()),
        SchedulerConfig::default(),
    );
    assert_eq!(scheduler.restore().await?, 1);

    let view = scheduler.get_batch(&interrupted.id).await?;
    assert_eq!(view.batch.state, BatchState::Failed);
    assert_eq!(view.batch.jobs[0].state, JobState::Completed);
    assert_eq!(view.batch.jobs[1].state, JobState::Failed);
    assert_eq!(store.get(&interrupted.id).await?.unwrap().state, BatchState::Failed);

    // restored terminal batches do not block waiters
    timeout(Duration::from_secs(1), scheduler.wait_for_batch(&interrupted.id)).await??;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_cancels_processing_batches() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let transcriber = Arc::new(ScriptedTranscriber::gated(gate.clone()));
    let scheduler = Arc::new(setup_scheduler(transcriber.clone()));
    let batch = create_batch_with_jobs(&scheduler, 1, 3).await?;
    let idle = scheduler.create_batch(None, None, None).await?;

    scheduler.start_batch(&batch.id).await?;
    wait_until_running(&transcriber, 1).await;

    let shutdown = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.shutdown().await }
    });
    sleep(Duration::from_millis(20)).await;
    gate.add_permits(10);
    timeout(Duration::from_secs(5), shutdown).await??;

    assert_eq!(scheduler.get_batch(&batch.id).await?.batch.state, BatchState::Cancelled);
    assert_eq!(scheduler.get_batch(&idle.id).await?.batch.state, BatchState::Pending);
    Ok(())
}

#[tokio::test]
async fn test_panicking_job_fails_alone() -> Result<()> {
    let transcriber = Arc::new(ScriptedTranscriber {
        panicking: ["video-1.mp4".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let scheduler = setup_scheduler(transcriber.clone());
    let batch = create_batch_with_jobs(&scheduler, 1, 3).await?;

    scheduler.start_batch(&batch.id).await?;
    let view = timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;

    assert_eq!(
        transcriber.started(),
        vec!["video-1.mp4", "video-2.mp4", "video-3.mp4"]
    );
    assert_eq!(view.batch.state, BatchState::Failed);
    assert_eq!(view.progress.failed_jobs, 1);
    assert_eq!(view.batch.jobs[0].state, JobState::Failed);
    assert!(view.batch.jobs[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("decoder crashed on video-1.mp4")));
    assert_eq!(view.batch.jobs[1].state, JobState::Completed);
    assert_eq!(view.batch.jobs[2].state, JobState::Completed);
    Ok(())
}

#[tokio::test]
async fn test_failure_after_cancel_stays_cancelled() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let transcriber = Arc::new(ScriptedTranscriber {
        failing: ["video-1.mp4".to_string(), "video-2.mp4".to_string()].into_iter().collect(),
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let scheduler = setup_scheduler(transcriber.clone());
    let batch = create_batch_with_jobs(&scheduler, 2, 3).await?;

    scheduler.start_batch(&batch.id).await?;
    wait_until_running(&transcriber, 2).await;
    scheduler.cancel_batch(&batch.id).await?;

    // both in-flight jobs now fail
    gate.add_permits(10);
    let view = timeout(Duration::from_secs(5), scheduler.wait_for_batch(&batch.id)).await??;

    assert_eq!(view.batch.state, BatchState::Cancelled);
    assert_eq!(view.progress.failed_jobs, 0);
    assert!(view
        .batch
        .jobs
        .iter()
        .all(|job| job.state == JobState::Cancelled && job.error.is_none()));
    assert_eq!(transcriber.started().len(), 2);
    Ok(())
}
